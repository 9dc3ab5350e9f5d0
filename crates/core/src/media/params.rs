use base64::prelude::{BASE64_STANDARD, Engine as _};

use super::{Codec, annexb};

/// Out-of-band parameter sets captured from the encoded bitstream,
/// published through SDP `a=fmtp` (RFC 6184 §8.1, RFC 7798 §7.1).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParameterSets {
    pub vps: Option<Vec<u8>>,
    pub sps: Option<Vec<u8>>,
    pub pps: Option<Vec<u8>>,
}

impl ParameterSets {
    /// Record any VPS/SPS/PPS NAL units in `access_unit`. Returns `true`
    /// when a stored set changed, e.g. after an encoder restart.
    pub fn update(&mut self, codec: Codec, access_unit: &[u8]) -> bool {
        let mut changed = false;
        for nal in annexb::nal_units(access_unit) {
            let slot = match (codec, codec.nal_type(nal)) {
                (Codec::H264, Some(7)) | (Codec::H265, Some(33)) => &mut self.sps,
                (Codec::H264, Some(8)) | (Codec::H265, Some(34)) => &mut self.pps,
                (Codec::H265, Some(32)) => &mut self.vps,
                _ => continue,
            };
            if slot.as_deref() != Some(nal) {
                *slot = Some(nal.to_vec());
                changed = true;
            }
        }
        changed
    }

    /// Derive profile-level-id from SPS NAL (RFC 6184 §8.1): bytes 1–3 are
    /// profile_idc, constraint_set, level_idc.
    fn profile_level_id(&self) -> Option<String> {
        let sps = self.sps.as_deref()?;
        if sps.len() < 4 {
            return None;
        }
        Some(format!("{:02x}{:02x}{:02x}", sps[1], sps[2], sps[3]))
    }

    /// `a=fmtp` line for payload type `pt`, `None` when the codec has
    /// nothing to say yet.
    pub fn fmtp(&self, codec: Codec, pt: u8) -> Option<String> {
        match codec {
            Codec::H264 => {
                let mut fmtp = format!("a=fmtp:{pt} packetization-mode=1");
                if let Some(pl) = self.profile_level_id() {
                    fmtp.push_str(&format!(";profile-level-id={pl}"));
                }
                if let (Some(sps), Some(pps)) = (&self.sps, &self.pps) {
                    fmtp.push_str(&format!(
                        ";sprop-parameter-sets={},{}",
                        BASE64_STANDARD.encode(sps),
                        BASE64_STANDARD.encode(pps)
                    ));
                }
                Some(fmtp)
            }
            Codec::H265 => {
                let (Some(vps), Some(sps), Some(pps)) = (&self.vps, &self.sps, &self.pps) else {
                    return None;
                };
                Some(format!(
                    "a=fmtp:{pt} sprop-vps={};sprop-sps={};sprop-pps={}",
                    BASE64_STANDARD.encode(vps),
                    BASE64_STANDARD.encode(sps),
                    BASE64_STANDARD.encode(pps)
                ))
            }
        }
    }
}
