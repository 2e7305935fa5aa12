//! Release signature verification

use std::cell::Cell;
use std::path::Path;

use anyhow::{Context, Result};
use openpgp::cert::{Cert, CertParser};
use openpgp::parse::stream::{
    DetachedVerifierBuilder, MessageLayer, MessageStructure, VerificationHelper,
};
use openpgp::parse::Parse;
use openpgp::policy::StandardPolicy;
use openpgp::KeyHandle;
use sequoia_openpgp as openpgp;

/// Outcome of checking a detached signature over a Release file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SignatureCheck {
    Accepted,
    /// The signature parsed, but none of it was made by an accepted key.
    NoAcceptedSignature,
}

pub trait SignatureChecker {
    /// Check `signature` as a detached signature over `release` against
    /// the identity named by `verifier`.
    fn check(&self, verifier: &str, signature: &Path, release: &Path) -> Result<SignatureCheck>;
}

/// Checks signatures against a keyring file; the verifier identity is the
/// path of that keyring (armored or binary).
pub struct KeyringChecker;

struct KeyringHelper<'a> {
    certs: &'a [Cert],
    accepted: &'a Cell<bool>,
}

impl VerificationHelper for KeyringHelper<'_> {
    fn get_certs(&mut self, _ids: &[KeyHandle]) -> openpgp::Result<Vec<Cert>> {
        Ok(self.certs.to_vec())
    }

    fn check(&mut self, structure: MessageStructure) -> openpgp::Result<()> {
        for layer in structure {
            if let MessageLayer::SignatureGroup { results } = layer {
                if results.iter().any(|r| r.is_ok()) {
                    self.accepted.set(true);
                }
            }
        }
        // an unacceptable signature is reported through the flag, not as a
        // verification error
        Ok(())
    }
}

impl SignatureChecker for KeyringChecker {
    fn check(&self, verifier: &str, signature: &Path, release: &Path) -> Result<SignatureCheck> {
        let certs = CertParser::from_file(verifier)
            .with_context(|| format!("cannot open keyring '{}'", verifier))?
            .collect::<openpgp::Result<Vec<Cert>>>()
            .with_context(|| format!("cannot parse keyring '{}'", verifier))?;
        let policy = StandardPolicy::new();
        let accepted = Cell::new(false);
        let helper = KeyringHelper {
            certs: &certs,
            accepted: &accepted,
        };
        let mut stream = DetachedVerifierBuilder::from_file(signature)
            .with_context(|| format!("cannot open signature '{}'", signature.display()))?
            .with_policy(&policy, None, helper)
            .context("cannot initialize signature verification")?;
        stream
            .verify_file(release)
            .with_context(|| format!("error verifying '{}'", release.display()))?;

        Ok(if accepted.get() {
            SignatureCheck::Accepted
        } else {
            SignatureCheck::NoAcceptedSignature
        })
    }
}

#[cfg(test)]
fn test_certificate(userid: &str) -> Cert {
    use openpgp::cert::CertBuilder;
    use openpgp::types::KeyFlags;

    let (cert, _) = CertBuilder::new()
        .add_userid(userid)
        .add_subkey(KeyFlags::empty().set_signing(), None, None)
        .generate()
        .unwrap();

    cert
}

#[cfg(test)]
fn detached_signature(cert: &Cert, content: &[u8]) -> Vec<u8> {
    use openpgp::serialize::stream::{Message, Signer};
    use std::io::Write;

    let policy = StandardPolicy::new();
    let keypair = cert
        .keys()
        .secret()
        .with_policy(&policy, None)
        .supported()
        .alive()
        .revoked(false)
        .for_signing()
        .next()
        .unwrap()
        .key()
        .clone()
        .into_keypair()
        .unwrap();
    let mut sink = Vec::new();
    let message = Message::new(&mut sink);
    let mut signer = Signer::new(message, keypair)
        .detached()
        .build()
        .unwrap();
    signer.write_all(content).unwrap();
    signer.finalize().unwrap();

    sink
}

#[test]
fn test_detached_verification() {
    use openpgp::serialize::SerializeInto;
    use std::fs;

    let dir = tempfile::tempdir().unwrap();
    let release_path = dir.path().join("debian_sid_Release");
    let signature_path = dir.path().join("debian_sid_Release.gpg");
    let keyring_path = dir.path().join("trusted.pgp");
    let other_keyring_path = dir.path().join("other.pgp");

    let cert = test_certificate("Archive Signing <archive@example.org>");
    let other = test_certificate("Somebody Else <else@example.org>");
    let content = b"Suite: sid\nSHA256:\n";
    fs::write(&release_path, content).unwrap();
    fs::write(&signature_path, detached_signature(&cert, content)).unwrap();
    fs::write(&keyring_path, cert.to_vec().unwrap()).unwrap();
    fs::write(&other_keyring_path, other.to_vec().unwrap()).unwrap();

    let keyring = keyring_path.to_string_lossy().to_string();
    let result = KeyringChecker
        .check(&keyring, &signature_path, &release_path)
        .unwrap();
    assert_eq!(result, SignatureCheck::Accepted);

    // signed by a key the keyring does not contain
    let other_keyring = other_keyring_path.to_string_lossy().to_string();
    let result = KeyringChecker
        .check(&other_keyring, &signature_path, &release_path)
        .unwrap();
    assert_eq!(result, SignatureCheck::NoAcceptedSignature);

    // tampered content no longer verifies
    fs::write(&release_path, b"Suite: tampered\n").unwrap();
    let result = KeyringChecker
        .check(&keyring, &signature_path, &release_path)
        .unwrap();
    assert_eq!(result, SignatureCheck::NoAcceptedSignature);
}
