use std::path::{Path, PathBuf};

/// Canonicalize path
///
/// Chromium sandboxing does not support Windows UNC paths which are used by
/// Rust when the path is relative. See
/// https://bugs.chromium.org/p/chromium/issues/detail?id=1415018.
pub(crate) async fn canonicalize<P: AsRef<Path> + Unpin>(path: P) -> std::io::Result<PathBuf> {
    let path = tokio::fs::canonicalize(path.as_ref()).await?;

    Ok(dunce::simplified(&path).to_path_buf())
}

/// Absolute path
pub(crate) fn absolute(path: PathBuf) -> std::io::Result<PathBuf> {
    let path = if path.is_absolute() {
        path
    } else {
        std::env::current_dir()?.join(path)
    };
    Ok(dunce::simplified(&path).to_path_buf())
}

/// Canonicalize path except if the target binary is snap, in this case only
/// make the path absolute
pub(crate) async fn canonicalize_except_snap(path: PathBuf) -> std::io::Result<PathBuf> {
    let executable_cleaned: PathBuf = canonicalize(&path).await?;

    // Handle case where the executable is provided by snap, ignore the
    // canonicalize result and only make the path absolute
    Ok(
        if executable_cleaned
            .to_str()
            .map(|p| p.ends_with("/snap"))
            .unwrap_or_default()
        {
            absolute(path)?
        } else {
            executable_cleaned
        },
    )
}
