use std::io::{Cursor, Read};

use thiserror::Error;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const ZIP_MAGIC: [u8; 2] = [b'P', b'K'];

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("corrupt gzip stream: {0}")]
    Gzip(#[source] std::io::Error),
}

/// Transparently unwraps a report payload.
///
/// Gzip is probed before zip. The zip branch returns the first entry
/// only; aggregate-report producers package exactly one file per
/// archive. Payloads that open as neither container are returned
/// unchanged, including archives that fail to open at all - the
/// downstream parser rejects those as invalid content. The one hard
/// error is a payload that carries the gzip magic but whose stream does
/// not decode.
pub fn decode(data: &[u8]) -> Result<Vec<u8>, DecodeError> {
    if data.starts_with(&GZIP_MAGIC) {
        return decode_gzip(data).map_err(DecodeError::Gzip);
    }

    if data.starts_with(&ZIP_MAGIC) {
        if let Ok(contents) = decode_zip_first_entry(data) {
            return Ok(contents);
        }
    }

    Ok(data.to_vec())
}

fn decode_gzip(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut decoder = flate2::read::GzDecoder::new(Cursor::new(data));
    let mut buf = Vec::new();
    decoder.read_to_end(&mut buf)?;
    Ok(buf)
}

fn decode_zip_first_entry(data: &[u8]) -> anyhow::Result<Vec<u8>> {
    let mut archive = zip::ZipArchive::new(Cursor::new(data))?;
    let mut entry = archive.by_index(0)?;
    let mut buf = Vec::new();
    entry.read_to_end(&mut buf)?;
    Ok(buf)
}
