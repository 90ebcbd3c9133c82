use crate::LaunchError;
use capsule_schema::KeyInfo;
use std::path::Path;

/// Turns user key material into the plaintext key of an encrypted image.
pub trait KeyProvider {
    fn plaintext_key(&self, key: &KeyInfo, image: &Path) -> Result<Vec<u8>, LaunchError>;
}

/// Passphrases are the key. PEM keys only unwrap a key stored in an image
/// key descriptor, which needs an image format reader this provider lacks.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassphraseKeyProvider;

impl KeyProvider for PassphraseKeyProvider {
    fn plaintext_key(&self, key: &KeyInfo, image: &Path) -> Result<Vec<u8>, LaunchError> {
        match key {
            KeyInfo::Passphrase(p) if p.is_empty() => {
                Err(LaunchError::Encryption("empty passphrase".to_owned()))
            }
            KeyInfo::Passphrase(p) => Ok(p.as_bytes().to_vec()),
            KeyInfo::PemFile(pem) => Err(LaunchError::Encryption(format!(
                "cannot decrypt {} with {}: PEM keys are not supported for this image format",
                image.display(),
                pem.display()
            ))),
        }
    }
}
