//! Builds the flag set for one engine invocation (spec.md §6).
//!
//! Pure function, unit-tested against the exact flag names spec.md §6
//! enumerates rather than against the engine's actual help output —
//! this crate never inspects the engine binary itself.

use std::path::Path;

use crate::config::UploaderConfig;
use crate::strategy::{OrderBy, StageParams};

/// Builds the argument vector for one stage invocation of the engine
/// binary (everything after the binary path itself).
///
/// `chunk_artifact`, when present, points at a file-list produced by
/// [`crate::chunker::ChunkPlan::materialize_batch`] and is passed via
/// the engine's file-list flag instead of uploading the whole source
/// tree in one pass.
#[must_use]
pub fn build_args(
    params: &StageParams,
    uploader: &UploaderConfig,
    credential: &str,
    chunk_artifact: Option<&Path>,
) -> Vec<String> {
    let mut args = vec![
        "copy".to_string(),
        uploader.local_path.to_string_lossy().into_owned(),
        uploader.remote_path.clone(),
        format!("--drive-service-account-file={credential}"),
        format!("--transfers={}", params.concurrency),
        format!("--max-transfer={}", params.stage_byte_cap),
        "--cutoff-mode=cautious".to_string(),
        "--stats=60s".to_string(),
        "-v".to_string(),
    ];

    if let Some(size_cap) = params.per_file_size_cap {
        args.push(format!("--max-size={size_cap}"));
    }

    if params.order_by == OrderBy::SizeDesc {
        args.push("--order-by=size,desc".to_string());
    }

    if let Some(path) = chunk_artifact {
        args.push(format!("--files-from={}", path.to_string_lossy()));
    }

    for (flag, value) in &uploader.engine_extras {
        args.push(format!("--{flag}={value}"));
    }

    args
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::ChunkedUploadConfig;
    use std::collections::HashMap;
    use std::path::PathBuf;

    fn uploader() -> UploaderConfig {
        UploaderConfig {
            local_path: PathBuf::from("/data/src"),
            remote_path: "remote:dest".to_string(),
            credential_path: PathBuf::from("/data/creds"),
            engine_extras: HashMap::new(),
            chunked_upload: ChunkedUploadConfig::default(),
            credentials: Vec::new(),
        }
    }

    fn params() -> StageParams {
        crate::strategy::select_strategy(500 * 1024 * 1024 * 1024, 750 * 1024 * 1024 * 1024, None, 1)
    }

    #[test]
    fn test_build_args_includes_required_flags() {
        let args = build_args(&params(), &uploader(), "sa1.json", None);
        assert_eq!(args[0], "copy");
        assert_eq!(args[1], "/data/src");
        assert_eq!(args[2], "remote:dest");
        assert!(args.iter().any(|a| a == "--drive-service-account-file=sa1.json"));
        assert!(args.iter().any(|a| a.starts_with("--transfers=")));
        assert!(args.iter().any(|a| a.starts_with("--max-transfer=")));
        assert!(args.contains(&"--cutoff-mode=cautious".to_string()));
        assert!(args.contains(&"--stats=60s".to_string()));
    }

    #[test]
    fn test_build_args_omits_size_cap_when_none() {
        let mut p = params();
        p.per_file_size_cap = None;
        let args = build_args(&p, &uploader(), "sa1.json", None);
        assert!(!args.iter().any(|a| a.starts_with("--max-size=")));
    }

    #[test]
    fn test_build_args_includes_chunk_artifact_flag() {
        let artifact = PathBuf::from("/tmp/chunk-0.list");
        let args = build_args(&params(), &uploader(), "sa1.json", Some(&artifact));
        assert!(args.iter().any(|a| a == "--files-from=/tmp/chunk-0.list"));
    }

    #[test]
    fn test_build_args_passes_through_engine_extras() {
        let mut uploader = uploader();
        uploader
            .engine_extras
            .insert("drive-chunk-size".to_string(), "128M".to_string());
        let args = build_args(&params(), &uploader, "sa1.json", None);
        assert!(args.contains(&"--drive-chunk-size=128M".to_string()));
    }
}
