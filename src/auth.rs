//! Credential and private-key resolution.
//!
//! Accepts OpenSSH and PEM material (RSA, DSA, ECDSA, Ed25519, PKCS#8) via
//! `russh::keys::decode_secret_key`. A path is read from disk exactly once;
//! already-resolved keys pass through untouched. The resolver never mutates
//! its input and never logs secret bytes.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use secrecy::{ExposeSecret, SecretString};

use crate::config::KeyMaterial;
use crate::error::{Error, Result};

/// Resolve key material into a decoded private key.
///
/// Unreadable files map to `PermissionDenied` when the OS says so and
/// `BadCredentials` otherwise; malformed key text is always
/// `BadCredentials`.
pub async fn resolve_key(
    material: &KeyMaterial,
    passphrase: Option<&SecretString>,
) -> Result<Arc<russh::keys::PrivateKey>> {
    match material {
        KeyMaterial::Resolved(key) => Ok(Arc::clone(key)),
        KeyMaterial::Inline(text) => decode(text.expose_secret(), passphrase),
        KeyMaterial::Path(path) => {
            let path = expand_home(path);
            let text = tokio::fs::read_to_string(&path).await.map_err(|err| {
                if err.kind() == std::io::ErrorKind::PermissionDenied {
                    Error::PermissionDenied(format!("private key {}: {err}", path.display()))
                } else {
                    Error::BadCredentials(format!(
                        "cannot read private key {}: {err}",
                        path.display()
                    ))
                }
            })?;
            decode(&text, passphrase)
        }
    }
}

fn decode(text: &str, passphrase: Option<&SecretString>) -> Result<Arc<russh::keys::PrivateKey>> {
    let pass = passphrase.map(|p| p.expose_secret());
    let key = russh::keys::decode_secret_key(text, pass)
        .map_err(|err| Error::BadCredentials(format!("malformed private key: {err}")))?;
    Ok(Arc::new(key))
}

/// `~/...` expansion for key paths entered by the user.
pub(crate) fn expand_home(path: &Path) -> PathBuf {
    let Some(s) = path.to_str() else {
        return path.to_path_buf();
    };
    if let Some(rest) = s.strip_prefix("~/").or_else(|| s.strip_prefix("~\\")) {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    path.to_path_buf()
}

/// Strip non-hex characters (colons, spaces, …) and lowercase. Used when
/// comparing host-key fingerprints entered by hand.
pub fn normalize_hex(s: &str) -> String {
    s.chars()
        .filter(|c| c.is_ascii_hexdigit())
        .collect::<String>()
        .to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_hex_strips_separators() {
        assert_eq!(normalize_hex("AB:cd 12-ef"), "abcd12ef");
        assert_eq!(normalize_hex(""), "");
    }

    #[test]
    fn expand_home_only_touches_tilde_prefix() {
        let plain = Path::new("/etc/key");
        assert_eq!(expand_home(plain), PathBuf::from("/etc/key"));
        if let Some(home) = std::env::var_os("HOME") {
            let expanded = expand_home(Path::new("~/id_ed25519"));
            assert_eq!(expanded, PathBuf::from(home).join("id_ed25519"));
        }
    }

    #[tokio::test]
    async fn missing_key_file_is_bad_credentials() {
        let material = KeyMaterial::Path(PathBuf::from("/definitely/not/here/id_rsa"));
        let err = resolve_key(&material, None).await.unwrap_err();
        assert!(matches!(err, Error::BadCredentials(_)), "{err}");
    }

    #[tokio::test]
    async fn garbage_key_text_is_bad_credentials() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("id_rsa");
        tokio::fs::write(&path, "not a key at all").await.unwrap();
        let err = resolve_key(&KeyMaterial::Path(path), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BadCredentials(_)), "{err}");
    }

    #[tokio::test]
    async fn inline_garbage_is_bad_credentials() {
        let material = KeyMaterial::Inline(SecretString::from("----".to_string()));
        let err = resolve_key(&material, None).await.unwrap_err();
        assert!(matches!(err, Error::BadCredentials(_)), "{err}");
    }
}
