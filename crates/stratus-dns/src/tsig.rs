//! TSIG credential handling.
//!
//! The server looks up the signing credential by the key name found in the
//! request's TSIG record, builds a [`Key`] from the stored base64 secret,
//! and hands it to `tsig::ServerSequence` for verification and response
//! signing (which also chains MACs across multi-message AXFR responses).

use std::str::FromStr;
use std::sync::Arc;

use base64::Engine;
use domain::base::iana::Rtype;
use domain::base::message::Message;
use domain::base::name::ToDname;
use domain::dep::octseq::Octets;
use domain::rdata::tsig::Tsig;
use domain::tsig::{Algorithm, Key, KeyName, KeyStore};

use stratus_common::types::{Credential, CredentialKind};
use stratus_common::{Error, Result};

use crate::record::abs_string;

/// What a request's TSIG record tells us before verification.
#[derive(Debug, Clone)]
pub struct TsigPeek {
    /// Key name, lower-case, without the trailing dot (credential form).
    pub key_name: String,
    /// None for unrecognized algorithm names; verification then fails
    /// with BADKEY through the key store.
    pub algorithm: Option<Algorithm>,
}

/// Finds the TSIG record of a request without verifying it.
///
/// Returns an error when a TSIG record is present anywhere but as the last
/// record of the additional section; the server answers FORMERR in that
/// case.
pub fn peek_tsig<Octs>(msg: &Message<Octs>) -> Result<Option<TsigPeek>>
where
    Octs: Octets + ?Sized,
{
    let section = msg
        .additional()
        .map_err(|e| Error::Protocol(format!("parsing additional: {e}")))?;
    let mut peek = None;
    let mut records_after = 0usize;
    for item in section {
        let rec = item
            .map_err(|e| Error::Protocol(format!("parsing additional: {e}")))?;
        if peek.is_some() {
            records_after += 1;
        }
        if rec.rtype() == Rtype::Tsig {
            let parsed = rec
                .to_record::<Tsig<_, _>>()
                .map_err(|e| Error::Protocol(format!("parsing tsig: {e}")))?
                .ok_or_else(|| Error::Protocol("malformed tsig".to_string()))?;
            let name = abs_string(parsed.owner());
            peek = Some(TsigPeek {
                key_name: name
                    .trim_end_matches('.')
                    .to_ascii_lowercase(),
                algorithm: Algorithm::from_dname(parsed.data().algorithm()),
            });
        }
    }
    if peek.is_some() && records_after > 0 {
        return Err(Error::Protocol(
            "tsig must be the last record of the additional section".to_string(),
        ));
    }
    Ok(peek)
}

/// Builds a signing key from a stored TSIG credential.
///
/// The key name is the credential name with the trailing dot restored.
pub fn credential_key(cred: &Credential, algorithm: Algorithm) -> Result<Arc<Key>> {
    if cred.kind != CredentialKind::Tsig {
        return Err(Error::user(format!("credential {:?} is not a tsig key", cred.name)));
    }
    let secret = base64::engine::general_purpose::STANDARD
        .decode(&cred.tsig_secret)
        .map_err(|e| Error::user(format!("tsig secret of {:?}: {e}", cred.name)))?;
    let name = KeyName::from_str(&format!("{}.", cred.name))
        .map_err(|e| Error::user(format!("tsig key name {:?}: {e}", cred.name)))?;
    let key = Key::new(algorithm, &secret, name, None, None)
        .map_err(|e| Error::user(format!("tsig key {:?}: {e}", cred.name)))?;
    Ok(Arc::new(key))
}

/// Key store over the single key looked up for this request.
///
/// `None` makes every lookup fail, which `ServerSequence::request` turns
/// into the proper unsigned NOTAUTH/BADKEY answer.
#[derive(Clone, Default)]
pub struct SingleKeyStore(pub Option<Arc<Key>>);

impl KeyStore for SingleKeyStore {
    type Key = Arc<Key>;

    fn get_key<N: ToDname>(
        &self,
        name: &N,
        algorithm: Algorithm,
    ) -> Option<Self::Key> {
        let key = self.0.as_ref()?;
        if key.name() == name && key.algorithm() == algorithm {
            Some(key.clone())
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn tsig_credential(name: &str, secret: &[u8]) -> Credential {
        Credential {
            id: Uuid::nil(),
            created: Utc::now(),
            name: name.to_string(),
            kind: CredentialKind::Tsig,
            tsig_secret: base64::engine::general_purpose::STANDARD.encode(secret),
            tls_public_key: String::new(),
        }
    }

    #[test]
    fn key_from_credential() {
        let cred = tsig_credential("z0.example", b"0123456789abcdef0123456789abcdef");
        let key = credential_key(&cred, Algorithm::Sha256).unwrap();
        assert_eq!(key.algorithm(), Algorithm::Sha256);
        assert_eq!(abs_string(key.name()), "z0.example.");
    }

    #[test]
    fn bad_secret_rejected() {
        let mut cred = tsig_credential("z0.example", b"secret");
        cred.tsig_secret = "not base64!!".to_string();
        assert!(credential_key(&cred, Algorithm::Sha256).is_err());
    }

    #[test]
    fn store_matches_name_and_algorithm() {
        let cred = tsig_credential("z0.example", b"0123456789abcdef0123456789abcdef");
        let key = credential_key(&cred, Algorithm::Sha256).unwrap();
        let store = SingleKeyStore(Some(key));
        let name = KeyName::from_str("z0.example.").unwrap();
        assert!(store.get_key(&name, Algorithm::Sha256).is_some());
        assert!(store.get_key(&name, Algorithm::Sha512).is_none());
        let other = KeyName::from_str("other.example.").unwrap();
        assert!(store.get_key(&other, Algorithm::Sha256).is_none());
        assert!(SingleKeyStore(None).get_key(&name, Algorithm::Sha256).is_none());
    }
}
