//! GPU resource bookkeeping and asset loading.
//!
//! - `registry` tracks every live GPU resource so that leaks can be reported and everything can be
//!   disposed in bulk
//! - `cache` shares GPU resources between holders by key and disposes them with the last holder
//! - `gltf` turns glTF files into detached node templates that can be instantiated into a graph

pub mod cache;
pub mod gltf;
pub mod registry;

/// Reads a whole asset.
///
/// Natively relative paths are resolved against `./assets`, absolute paths are used as they are.
/// On the web the file is fetched relative to the page origin.
pub async fn load_binary(file_name: &str) -> anyhow::Result<Vec<u8>> {
    #[cfg(target_arch = "wasm32")]
    let data = {
        let url = format_url(file_name)?;
        reqwest::get(url).await?.bytes().await?.to_vec()
    };
    #[cfg(not(target_arch = "wasm32"))]
    let data = {
        let path = std::path::Path::new("./").join("assets").join(file_name);
        std::fs::read(&path).map_err(|e| anyhow::anyhow!("could not read {}: {}", path.display(), e))?
    };
    log::debug!("loaded {} ({} bytes)", file_name, data.len());
    Ok(data)
}

#[cfg(target_arch = "wasm32")]
fn format_url(file_name: &str) -> anyhow::Result<reqwest::Url> {
    use anyhow::Context as _;

    let window = web_sys::window().context("no window")?;
    let origin = window
        .location()
        .origin()
        .map_err(|_| anyhow::anyhow!("page origin is not available"))?;
    let base = reqwest::Url::parse(&format!("{}/assets/", origin))?;
    Ok(base.join(file_name)?)
}

/// Resolves `uri` relative to the directory of `base`.
pub(crate) fn resolve_relative(base: &str, uri: &str) -> String {
    match base.rfind('/') {
        Some(idx) => format!("{}/{}", &base[..idx], uri),
        None => uri.to_string(),
    }
}
