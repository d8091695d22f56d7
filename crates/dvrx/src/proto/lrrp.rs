//! LRRP location report decoding
//!
//! Location Request/Response Protocol reports arrive as UDP payloads
//! on port 4001 inside SAP-4 data calls. The body is a token stream:
//! each token byte selects a field of fixed length. Fixed-point
//! scaling recovers degrees from the 32-bit lat/lon fields.
//!
//! Real captures sometimes carry vendor tokens we do not know; the
//! decoder skips one byte and rescans, accepting the parse only when
//! a coordinate pair was found.

#[cfg(not(test))]
use log::trace;

#[cfg(test)]
use std::println as trace;

use crate::proto::LocationFix;

/// Degrees per count of the signed 31-bit latitude field
const LAT_SCALE: f64 = 90.0 / 2147483648.0;

/// Degrees per count of the signed 31-bit longitude field
const LON_SCALE: f64 = 180.0 / 2147483648.0;

// Token ids with fixed operand lengths. Anything not listed is
// unknown and triggers a resync.
fn token_len(token: u8) -> Option<usize> {
    match token {
        // header / envelope
        0x04 | 0x05 | 0x06 | 0x07 | 0x09 | 0x0B | 0x0D | 0x0F | 0x11 | 0x13 | 0x15 => Some(1),
        // request id, variable tag + 1-byte length handled separately
        0x22 => None,
        // timestamp
        0x34 | 0x35 => Some(5),
        // lat + lon pair
        0x51 => Some(8),
        // lat + lon + altitude
        0x55 => Some(11),
        // lat + lon + radius
        0x54 | 0x66 => Some(10),
        // speed
        0x6C => Some(2),
        // heading
        0x56 => Some(1),
        // result code
        0x37 | 0x38 => Some(1),
        _ => None,
    }
}

// LRRP envelope message types (report/request/answer families).
fn is_envelope(mt: u8) -> bool {
    matches!(
        mt,
        0x05 | 0x07 | 0x09 | 0x0B | 0x0D | 0x0F | 0x11 | 0x13 | 0x15
    )
}

fn read_coord(bytes: &[u8]) -> (f64, f64) {
    let lat_raw = i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    let lon_raw = i32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
    (lat_raw as f64 * LAT_SCALE, lon_raw as f64 * LON_SCALE)
}

/// Decode an LRRP report body into a location fix
///
/// Returns `None` when no coordinate token is present or the stream
/// is malformed beyond the resync heuristic.
pub fn decode(body: &[u8], source: u32) -> Option<LocationFix> {
    if body.len() < 4 {
        return None;
    }
    let mut body = body;
    if !is_envelope(body[0]) && body.len() > 9 && is_envelope(body[7]) {
        // MNIS transport prefix: seven bytes ahead of the envelope,
        // carrying a 16-bit field whose meaning is not published
        let opaque = u16::from_be_bytes([body[1], body[2]]);
        trace!("lrrp: MNIS prefix, field {:#06x}", opaque);
        body = &body[7..];
    }
    // message type + total length envelope
    let mut pos = 2usize;

    let mut fix: Option<LocationFix> = None;
    let mut speed = None;
    let mut heading = None;

    while pos < body.len() {
        let token = body[pos];
        pos += 1;

        // request-id style token: one length byte, then that many
        if token == 0x22 {
            let Some(&len) = body.get(pos) else { break };
            pos += 1 + len as usize;
            continue;
        }

        let Some(len) = token_len(token) else {
            // unknown token: slide one byte and rescan
            trace!("lrrp: unknown token {:#04x} at {}", token, pos - 1);
            continue;
        };
        if pos + len > body.len() {
            break;
        }
        let operand = &body[pos..pos + len];
        pos += len;

        match token {
            0x51 | 0x54 | 0x55 | 0x66 => {
                let (lat, lon) = read_coord(operand);
                let mut f = LocationFix {
                    source,
                    lat,
                    lon,
                    altitude_m: None,
                    speed_mph: None,
                    heading_deg: None,
                };
                if token == 0x55 {
                    // 24-bit altitude, centimeter counts
                    let raw =
                        u32::from_be_bytes([0, operand[8], operand[9], operand[10]]);
                    f.altitude_m = Some(raw as f32 * 0.01);
                }
                fix = Some(f);
            }
            0x6C => {
                // 16-bit speed, hundredths of mph
                let raw = u16::from_be_bytes([operand[0], operand[1]]);
                speed = Some(raw as f32 * 0.01);
            }
            0x56 => {
                // heading in 2-degree increments
                heading = Some(operand[0] as u16 * 2);
            }
            _ => {}
        }
    }

    let mut fix = fix?;
    if fix.lat == 0.0 && fix.lon == 0.0 {
        return None; // null island means no GPS lock
    }
    fix.speed_mph = speed;
    fix.heading_deg = heading;
    Some(fix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    fn coord_bytes(lat_deg: f64, lon_deg: f64) -> [u8; 8] {
        let lat = (lat_deg / LAT_SCALE).round() as i32;
        let lon = (lon_deg / LON_SCALE).round() as i32;
        let mut out = [0u8; 8];
        out[..4].copy_from_slice(&lat.to_be_bytes());
        out[4..].copy_from_slice(&lon.to_be_bytes());
        out
    }

    #[test]
    fn test_decode_coordinate_pair() {
        let mut body = vec![0x13, 0x00]; // envelope
        body.push(0x51);
        body.extend_from_slice(&coord_bytes(38.8895, -77.0353));

        let fix = decode(&body, 5678).unwrap();
        assert_eq!(fix.source, 5678);
        assert_approx_eq!(fix.lat, 38.8895, 1e-4);
        assert_approx_eq!(fix.lon, -77.0353, 1e-4);
        assert!(fix.altitude_m.is_none());
    }

    #[test]
    fn test_decode_speed_and_heading() {
        let mut body = vec![0x13, 0x00];
        body.push(0x51);
        body.extend_from_slice(&coord_bytes(45.0, -122.5));
        body.push(0x6C);
        body.extend_from_slice(&2550u16.to_be_bytes()); // 25.50 mph
        body.push(0x56);
        body.push(45); // 90 degrees

        let fix = decode(&body, 1).unwrap();
        assert_approx_eq!(fix.speed_mph.unwrap(), 25.5, 1e-3);
        assert_eq!(fix.heading_deg, Some(90));
    }

    #[test]
    fn test_decode_altitude_token() {
        let mut body = vec![0x13, 0x00];
        body.push(0x55);
        body.extend_from_slice(&coord_bytes(10.0, 20.0));
        // 123.45 m = 12345 cm
        body.extend_from_slice(&[0x00, 0x30, 0x39]);

        let fix = decode(&body, 1).unwrap();
        assert_approx_eq!(fix.altitude_m.unwrap(), 123.45, 1e-2);
    }

    #[test]
    fn test_null_island_rejected() {
        let mut body = vec![0x13, 0x00];
        body.push(0x51);
        body.extend_from_slice(&[0u8; 8]);
        assert!(decode(&body, 1).is_none());
    }

    #[test]
    fn test_resync_skips_unknown_token() {
        let mut body = vec![0x13, 0x00];
        body.push(0xE7); // vendor token, unknown
        body.push(0x51);
        body.extend_from_slice(&coord_bytes(-33.86, 151.21));

        let fix = decode(&body, 1).unwrap();
        assert_approx_eq!(fix.lat, -33.86, 1e-3);
    }

    #[test]
    fn test_truncated_operand() {
        let mut body = vec![0x13, 0x00, 0x51];
        body.extend_from_slice(&[0x01, 0x02, 0x03]); // short
        assert!(decode(&body, 1).is_none());
    }

    #[test]
    fn test_mnis_prefix_skipped() {
        let mut body = vec![0x08, 0x12, 0x34, 0x00, 0x00, 0x00, 0x00]; // MNIS
        body.extend_from_slice(&[0x13, 0x00]); // envelope
        body.push(0x51);
        body.extend_from_slice(&coord_bytes(40.4, -3.7));

        let fix = decode(&body, 9).unwrap();
        assert_approx_eq!(fix.lat, 40.4, 1e-3);
        assert_approx_eq!(fix.lon, -3.7, 1e-3);
    }

    #[test]
    fn test_request_id_skipped() {
        let mut body = vec![0x13, 0x00];
        body.push(0x22);
        body.push(0x04);
        body.extend_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF]);
        body.push(0x51);
        body.extend_from_slice(&coord_bytes(51.5, -0.12));

        let fix = decode(&body, 1).unwrap();
        assert_approx_eq!(fix.lon, -0.12, 1e-3);
    }
}
