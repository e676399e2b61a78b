//! The clipboard wire protocol: framed JSON packets and the folder
//! manifest they carry.

pub mod manifest;
pub mod packet;

use base64::engine::general_purpose::PAD;
use base64::engine::GeneralPurpose;
use base64::alphabet;

/// Base64 engine for CHUNK payloads (standard alphabet, padded).
pub const CHUNK_BASE64: GeneralPurpose = GeneralPurpose::new(&alphabet::STANDARD, PAD);
