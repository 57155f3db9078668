//! Object layout shared by every driver.
//!
//! Blobs live at `blobs/<algorithm>/<hex[0..2]>/<hex[2..4]>/<hex>` and
//! in-progress uploads at `blob_uploads/<upload-id>`, both relative to the
//! driver's configured root directory.

use camino::{Utf8Path, Utf8PathBuf};

/// Directory holding content-addressed blobs.
pub const BLOBS: &str = "blobs";

/// Directory holding in-progress uploads.
pub const UPLOADS: &str = "blob_uploads";

/// Canonical path of a blob.
pub fn blob(algorithm: &str, hex: &str) -> Utf8PathBuf {
    let mut path = Utf8PathBuf::from(BLOBS);
    path.push(algorithm);
    if hex.len() >= 4 && hex.is_char_boundary(2) && hex.is_char_boundary(4) {
        path.push(&hex[0..2]);
        path.push(&hex[2..4]);
    }
    path.push(hex);
    path
}

/// Object path of an upload session.
pub fn upload(upload_id: &str) -> Utf8PathBuf {
    Utf8Path::new(UPLOADS).join(upload_id)
}

/// Strip leading separators and dots so a key can never escape the root.
pub fn sanitize(path: &str) -> &str {
    path.trim_start_matches(['/', '.'])
}

/// Join a (sanitized) relative path under a root.
pub fn join_root(root: &Utf8Path, path: &Utf8Path) -> Utf8PathBuf {
    let relative = sanitize(path.as_str());
    if root.as_str().is_empty() {
        Utf8PathBuf::from(relative)
    } else {
        root.join(relative)
    }
}

/// Whether `key` is removed by a recursive delete of `prefix`.
///
/// A key matches when it equals the prefix, or when the character right after
/// the prefix is `/`. Deleting `a/b` never touches `a/bc`.
pub fn within_prefix(prefix: &str, key: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    match key.strip_prefix(prefix) {
        Some("") => true,
        Some(rest) => rest.starts_with('/'),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blob_layout() {
        assert_eq!(
            blob("sha256", "88d4266fd4e6338d13b845fcf289579d209c897823b9217da3e161936f031589"),
            Utf8PathBuf::from(
                "blobs/sha256/88/d4/88d4266fd4e6338d13b845fcf289579d209c897823b9217da3e161936f031589"
            )
        );
    }

    #[test]
    fn sanitize_strips_escapes() {
        assert_eq!(sanitize("/../etc/passwd"), "etc/passwd");
        assert_eq!(sanitize("./blobs"), "blobs");
        assert_eq!(
            join_root(Utf8Path::new("/var/lib/registry"), Utf8Path::new("/blobs/x")),
            Utf8PathBuf::from("/var/lib/registry/blobs/x")
        );
        assert_eq!(
            join_root(Utf8Path::new(""), Utf8Path::new("/blobs/x")),
            Utf8PathBuf::from("blobs/x")
        );
    }

    #[test]
    fn prefix_requires_separator() {
        assert!(within_prefix("blob_uploads/abc", "blob_uploads/abc"));
        assert!(within_prefix("blob_uploads/abc", "blob_uploads/abc/1"));
        assert!(within_prefix("blob_uploads/abc/", "blob_uploads/abc/1"));
        assert!(!within_prefix("blob_uploads/abc", "blob_uploads/abcd"));
        assert!(!within_prefix("blob_uploads/abc", "blob_uploads/ab"));
    }
}
