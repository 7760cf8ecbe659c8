use crate::error::{Result, ShakerError};
use crate::index::Document;
use super::hasher::hash_bytes;
use super::walker::FileMetadata;

/// Read a file into a document for the index.
///
/// The digest is taken from the bytes actually read, so the manifest records
/// exactly what was embedded even if the file changed after classification.
/// Non-UTF-8 content is decoded lossily.
pub fn load_document(file: &FileMetadata) -> Result<Document> {
    let bytes = std::fs::read(&file.absolute_path).map_err(|source| ShakerError::FileRead {
        path: file.absolute_path.clone(),
        source,
    })?;

    Ok(Document {
        name: file.name.clone(),
        digest: hash_bytes(&bytes),
        text: String::from_utf8_lossy(&bytes).into_owned(),
    })
}

/// Load several files, failing on the first unreadable one.
pub fn load_documents<'a, I>(files: I) -> Result<Vec<Document>>
where
    I: IntoIterator<Item = &'a FileMetadata>,
{
    files.into_iter().map(load_document).collect()
}
