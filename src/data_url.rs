//! Images as `data:` URLs, for vision prompts.

use base64::{Engine as _, prelude::BASE64_STANDARD};

use crate::prelude::*;

/// Convert binary data to a `data:` URL.
pub fn data_url(mime_type: &str, data: &[u8]) -> String {
    // No percent-encoding. Several LLM APIs reject it.
    format!("data:{};base64,{}", mime_type, BASE64_STANDARD.encode(data))
}

/// Figure out what kind of image we have. We trust the file's contents over
/// its extension, because phone photos get renamed in all sorts of ways.
pub fn image_mime_type(path: &Path, data: &[u8]) -> Result<String> {
    if let Some(kind) = infer::get(data) {
        return Ok(kind.mime_type().to_owned());
    }
    mime_guess::from_path(path)
        .first()
        .map(|mime| mime.essence_str().to_owned())
        .ok_or_else(|| anyhow!("cannot determine image type of {}", path.display()))
}

/// Read an image file into a `data:` URL.
pub async fn image_data_url(path: &Path) -> Result<String> {
    let data = tokio::fs::read(path)
        .await
        .with_context(|| format!("cannot read image {}", path.display()))?;
    let mime_type = image_mime_type(path, &data)?;
    if !mime_type.starts_with("image/") {
        return Err(anyhow!(
            "{} is {}, not an image",
            path.display(),
            mime_type
        ));
    }
    Ok(data_url(&mime_type, &data))
}
