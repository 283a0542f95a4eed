//! Program construction.
//!
//! Streams uploaded module bytes once through a running hash and the loader,
//! enforcing size limits along the way. The loader itself is an external
//! collaborator behind [`ModuleLoader`]; this module owns the hashing, the
//! alleged-hash check, and the limit enforcement.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use bytes::{Bytes, BytesMut};
use sha2::{Digest, Sha384};
use tokio::io::AsyncReadExt;

use crate::api::ModuleUpload;
use crate::image::{InstanceImage, ProgramImage};
use crate::types::config::DefaultLimits;
use crate::types::{Error, ModuleId, Result};

const READ_CHUNK: usize = 32 * 1024;

/// Compiler seam. Turns canonical module bytes into an immutable program
/// image with the given breakpoint set fixed into the text.
pub trait ModuleLoader: Send + Sync {
    fn load(&self, module: Bytes, breakpoints: &[u64]) -> Result<ProgramImage>;

    /// Combine a program's code with a suspended instance's state into the
    /// canonical bytes of a new module.
    fn snapshot(&self, program: &ProgramImage, instance: &InstanceImage) -> Result<Bytes>;
}

/// Content hash of canonical module bytes, as a module id.
pub fn hash_module_bytes(content: &[u8]) -> ModuleId {
    let digest = Sha384::digest(content);
    ModuleId::from_digest(URL_SAFE_NO_PAD.encode(digest))
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    let (a, b) = (a.as_bytes(), b.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// A built program, not yet merged into the server map.
#[derive(Debug)]
pub struct BuiltProgram {
    pub id: ModuleId,
    pub image: ProgramImage,
}

/// Read, hash, and load an uploaded module. The upload's stream is consumed
/// exactly once. If the upload carries an alleged hash it must match the
/// computed id; comparison is constant-time.
pub async fn build_program(
    loader: &dyn ModuleLoader,
    limits: &DefaultLimits,
    upload: &mut ModuleUpload,
    with_instance: bool,
) -> Result<BuiltProgram> {
    if upload.length > limits.max_module_size as u64 {
        return Err(Error::resource_limit("module size limit exceeded"));
    }
    let mut stream = upload
        .take_stream()
        .ok_or_else(|| Error::module_error("module content already consumed"))?;

    let mut content = BytesMut::with_capacity(upload.length as usize);
    let mut hasher = Sha384::new();
    let mut chunk = vec![0u8; READ_CHUNK];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        if content.len() + n > limits.max_module_size {
            return Err(Error::resource_limit("module size limit exceeded"));
        }
        hasher.update(&chunk[..n]);
        content.extend_from_slice(&chunk[..n]);
    }
    if content.len() as u64 != upload.length {
        return Err(Error::module_error("module content length mismatch"));
    }

    let id = ModuleId::from_digest(URL_SAFE_NO_PAD.encode(hasher.finalize()));
    if !upload.hash.is_empty() && !constant_time_eq(upload.hash.as_str(), id.as_str()) {
        return Err(Error::ModuleHashMismatch);
    }

    let image = load_image(loader, limits, content.freeze(), &[], with_instance)?;
    Ok(BuiltProgram { id, image })
}

/// Replay known module bytes through the loader. Used for source fetches and
/// startup loads where the id is already the content hash.
pub fn build_known_program(
    loader: &dyn ModuleLoader,
    limits: &DefaultLimits,
    id: &ModuleId,
    content: Bytes,
    with_instance: bool,
) -> Result<BuiltProgram> {
    if content.len() > limits.max_module_size {
        return Err(Error::resource_limit("module size limit exceeded"));
    }
    let computed = hash_module_bytes(&content);
    if computed != *id {
        return Err(Error::ModuleHashMismatch);
    }
    let image = load_image(loader, limits, content, &[], with_instance)?;
    Ok(BuiltProgram {
        id: computed,
        image,
    })
}

/// Replay a program's bytes with an alternate breakpoint set, producing a
/// fresh image and call map for the debug flow.
pub fn rebuild_program_image(
    loader: &dyn ModuleLoader,
    limits: &DefaultLimits,
    module: Bytes,
    breakpoints: &[u64],
) -> Result<ProgramImage> {
    if breakpoints.len() > limits.max_breakpoints {
        return Err(Error::resource_limit("breakpoint limit exceeded"));
    }
    load_image(loader, limits, module, breakpoints, false)
}

fn load_image(
    loader: &dyn ModuleLoader,
    limits: &DefaultLimits,
    content: Bytes,
    breakpoints: &[u64],
    with_instance: bool,
) -> Result<ProgramImage> {
    let image = loader.load(content, breakpoints)?;
    if image.text().len() > limits.max_text_size {
        return Err(Error::resource_limit("text size limit exceeded"));
    }
    if image.stack_usage() > limits.max_stack_size {
        return Err(Error::resource_limit("stack size limit exceeded"));
    }
    if with_instance && image.memory_size() > limits.max_memory_size {
        return Err(Error::resource_limit("memory size limit exceeded"));
    }
    Ok(image)
}
