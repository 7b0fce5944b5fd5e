//! Replay container reading.
//!
//! A replay file is a small block-framed header followed by the recorded
//! packet stream. The first block is a JSON metadata document; the body is
//! Blowfish-encrypted with a fixed key, XOR-chained in 8-byte blocks, then
//! zlib-deflated.

use std::io::Read;

use crypto::blowfish::Blowfish;
use crypto::symmetriccipher::BlockDecryptor;
use nom::bytes::complete::take;
use nom::number::complete::le_u32;
use serde::{Deserialize, Serialize};

use crate::types::Version;
use crate::{Error, Result};

pub const REPLAY_MAGIC: u32 = 0x1134_3212;

const BLOWFISH_KEY: [u8; 16] = [
    0x29, 0xB7, 0xC9, 0x09, 0x38, 0x3F, 0x84, 0x88, 0xFA, 0x98, 0xEC, 0x4E, 0x13, 0x19, 0x79,
    0xFB,
];

/// The "open" metadata document embedded at the head of every replay.
///
/// Field names follow the on-disk JSON; everything beyond the handful of
/// fields the pipeline consumes is tolerated and ignored.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayMeta {
    #[serde(rename = "clientVersionFromExe")]
    pub client_version_from_exe: String,
    #[serde(rename = "gameMode")]
    pub game_mode: i32,
    #[serde(rename = "matchGroup")]
    pub match_group: String,
    #[serde(rename = "mapName")]
    pub map_name: String,
    #[serde(rename = "playerName")]
    pub player_name: String,
    #[serde(rename = "playerVehicle")]
    pub player_vehicle: String,
    pub scenario: String,
    pub duration: f64,
}

impl ReplayMeta {
    pub fn version(&self) -> Version {
        Version::from_client_exe(&self.client_version_from_exe)
    }

    /// Map name with the `spaces/` resource prefix removed.
    pub fn bare_map_name(&self) -> &str {
        self.map_name
            .strip_prefix("spaces/")
            .unwrap_or(&self.map_name)
    }
}

/// A parsed replay: open metadata plus the decrypted, inflated packet
/// stream.
#[derive(Debug)]
pub struct ReplayFile {
    pub meta: ReplayMeta,
    pub packet_data: Vec<u8>,
}

impl ReplayFile {
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let (body, meta) = parse_header(data)?;
        let packet_data = decrypt_and_inflate(body)?;
        Ok(ReplayFile { meta, packet_data })
    }

    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let data = std::fs::read(path)?;
        Self::from_bytes(&data)
    }
}

fn parse_blocks(i: &[u8]) -> crate::IResult<&[u8], (u32, Vec<&[u8]>)> {
    let (i, magic) = le_u32(i)?;
    let (mut i, block_count) = le_u32(i)?;
    let mut blocks = Vec::with_capacity(block_count as usize);
    for _ in 0..block_count {
        let (rest, len) = le_u32(i)?;
        let (rest, block) = take(len as usize)(rest)?;
        blocks.push(block);
        i = rest;
    }
    Ok((i, (magic, blocks)))
}

fn parse_header(data: &[u8]) -> Result<(&[u8], ReplayMeta)> {
    let (body, (magic, blocks)) =
        parse_blocks(data).map_err(|_| Error::corrupt("replay header"))?;

    if magic != REPLAY_MAGIC {
        return Err(Error::corrupt(format!("bad magic {magic:#x}")));
    }
    let meta_block = blocks
        .first()
        .ok_or_else(|| Error::corrupt("missing metadata block"))?;
    let meta: ReplayMeta = serde_json::from_slice(meta_block)
        .map_err(|e| Error::corrupt(format!("metadata json: {e}")))?;

    Ok((body, meta))
}

/// Blowfish-ECB over 8-byte blocks with XOR chaining against the previous
/// decrypted block, followed by zlib inflation. A trailing partial block is
/// discarded, matching the recorder.
fn decrypt_and_inflate(body: &[u8]) -> Result<Vec<u8>> {
    let cipher = Blowfish::new(&BLOWFISH_KEY);
    let mut decrypted = Vec::with_capacity(body.len());
    let mut previous = [0u8; 8];
    let mut first = true;

    for chunk in body.chunks_exact(8) {
        let mut block = [0u8; 8];
        cipher.decrypt_block(chunk, &mut block);
        if !first {
            for (b, p) in block.iter_mut().zip(previous.iter()) {
                *b ^= *p;
            }
        }
        first = false;
        previous = block;
        decrypted.extend_from_slice(&block);
    }

    let mut inflated = Vec::new();
    flate2::read::ZlibDecoder::new(decrypted.as_slice())
        .read_to_end(&mut inflated)
        .map_err(|e| Error::corrupt(format!("zlib body: {e}")))?;
    Ok(inflated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crypto::symmetriccipher::BlockEncryptor;
    use std::io::Write;

    /// Inverse of the reader path, used only to build fixtures.
    fn deflate_and_encrypt(packets: &[u8]) -> Vec<u8> {
        let mut encoder =
            flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(packets).unwrap();
        let mut compressed = encoder.finish().unwrap();
        while compressed.len() % 8 != 0 {
            compressed.push(0);
        }

        let cipher = Blowfish::new(&BLOWFISH_KEY);
        let mut out = Vec::with_capacity(compressed.len());
        let mut previous = [0u8; 8];
        let mut first = true;
        for chunk in compressed.chunks_exact(8) {
            let mut plain = [0u8; 8];
            plain.copy_from_slice(chunk);
            if !first {
                for (b, p) in plain.iter_mut().zip(previous.iter()) {
                    *b ^= *p;
                }
            }
            first = false;
            let mut block = [0u8; 8];
            cipher.encrypt_block(&plain, &mut block);
            // chain against the *decrypted* value the reader will observe
            previous = chunk.try_into().unwrap();
            out.extend_from_slice(&block);
        }
        out
    }

    fn build_replay(meta_json: &str, packets: &[u8]) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(&REPLAY_MAGIC.to_le_bytes());
        data.extend_from_slice(&1u32.to_le_bytes());
        data.extend_from_slice(&(meta_json.len() as u32).to_le_bytes());
        data.extend_from_slice(meta_json.as_bytes());
        data.extend(deflate_and_encrypt(packets));
        data
    }

    #[test]
    fn roundtrips_meta_and_body() {
        let meta = r#"{
            "clientVersionFromExe": "0,10,9,0",
            "gameMode": 7,
            "matchGroup": "pvp",
            "mapName": "spaces/17_NA_fault_line",
            "playerName": "TestPlayer",
            "duration": 1200.0
        }"#;
        // zlib padding means the inflated body can carry trailing zeros;
        // pad the fixture to an 8-byte multiple up front to compare exactly.
        let packets = [1u8, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16];

        let replay = build_replay(meta, &packets);
        let parsed = ReplayFile::from_bytes(&replay).unwrap();

        assert_eq!(parsed.meta.client_version_from_exe, "0,10,9,0");
        assert_eq!(parsed.meta.game_mode, 7);
        assert_eq!(parsed.meta.bare_map_name(), "17_NA_fault_line");
        assert_eq!(parsed.meta.version().bundle_dir(), "0_10_9");
        assert_eq!(&parsed.packet_data, &packets);
    }

    #[test]
    fn bad_magic_is_corrupt() {
        let mut replay = build_replay("{}", &[0u8; 8]);
        replay[0] ^= 0xFF;
        assert!(matches!(
            ReplayFile::from_bytes(&replay),
            Err(Error::Corrupt(_))
        ));
    }

    #[test]
    fn truncated_header_is_corrupt() {
        let replay = build_replay("{}", &[0u8; 8]);
        assert!(matches!(
            ReplayFile::from_bytes(&replay[..6]),
            Err(Error::Corrupt(_))
        ));
    }
}
