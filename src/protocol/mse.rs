//! Message Stream Encryption (MSE) as an opaque pre-handshake step.
//!
//! The core does not implement the MSE key exchange itself — per the
//! external-interfaces contract it is treated as a negotiation that yields
//! either a `(cipher, mode)` pair or an error. What the core *does* own is
//! the policy around that outcome: on outbound connections, when encryption
//! is enabled and not `Disabled`, MSE runs before the BitTorrent handshake
//! and the resulting cipher wraps everything that follows, including the
//! handshake bytes themselves.

use crate::conf::EncryptionMode;

/// The negotiated transport mode after an MSE attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportMode {
    Plaintext,
    Encrypted,
}

/// Abstracts the symmetric cipher MSE negotiation would produce. Production
/// code plugs in a real RC4-based implementation; this crate only needs the
/// seam so the policy below can be expressed and tested.
pub trait Cipher: Send {
    fn encrypt(&mut self, data: &mut [u8]);
    fn decrypt(&mut self, data: &mut [u8]);
}

/// A cipher that performs no transformation, used when encryption is
/// disabled or MSE fell back to plaintext.
pub struct NullCipher;

impl Cipher for NullCipher {
    fn encrypt(&mut self, _data: &mut [u8]) {}
    fn decrypt(&mut self, _data: &mut [u8]) {}
}

/// Performs (or stands in for) the MSE key exchange over an already
/// connected transport, producing a cipher on success.
pub trait MseNegotiator {
    fn negotiate(&self) -> Result<Box<dyn Cipher>, MseError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
#[error("MSE negotiation failed")]
pub struct MseError;

/// Applies `mode`'s fallback policy to the outcome of an MSE attempt.
///
/// - `Disabled`: MSE is never attempted; always plaintext.
/// - `Preferred`: a failed negotiation falls back to plaintext rather than
///   aborting the connection.
/// - `Required`: a failed negotiation closes the connection.
pub fn establish_transport(
    mode: EncryptionMode,
    negotiator: &dyn MseNegotiator,
) -> Result<(Box<dyn Cipher>, TransportMode), MseError> {
    match mode {
        EncryptionMode::Disabled => Ok((Box::new(NullCipher), TransportMode::Plaintext)),
        EncryptionMode::Preferred => match negotiator.negotiate() {
            Ok(cipher) => Ok((cipher, TransportMode::Encrypted)),
            Err(_) => Ok((Box::new(NullCipher), TransportMode::Plaintext)),
        },
        EncryptionMode::Required => {
            let cipher = negotiator.negotiate()?;
            Ok((cipher, TransportMode::Encrypted))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct AlwaysFails;
    impl MseNegotiator for AlwaysFails {
        fn negotiate(&self) -> Result<Box<dyn Cipher>, MseError> {
            Err(MseError)
        }
    }

    struct AlwaysSucceeds;
    impl MseNegotiator for AlwaysSucceeds {
        fn negotiate(&self) -> Result<Box<dyn Cipher>, MseError> {
            Ok(Box::new(NullCipher))
        }
    }

    #[test]
    fn disabled_never_attempts_negotiation() {
        let (_, mode) = establish_transport(EncryptionMode::Disabled, &AlwaysFails).unwrap();
        assert_eq!(mode, TransportMode::Plaintext);
    }

    #[test]
    fn preferred_falls_back_to_plaintext_on_failure() {
        let (_, mode) = establish_transport(EncryptionMode::Preferred, &AlwaysFails).unwrap();
        assert_eq!(mode, TransportMode::Plaintext);
    }

    #[test]
    fn preferred_uses_cipher_on_success() {
        let (_, mode) = establish_transport(EncryptionMode::Preferred, &AlwaysSucceeds).unwrap();
        assert_eq!(mode, TransportMode::Encrypted);
    }

    #[test]
    fn required_closes_connection_on_failure() {
        assert!(establish_transport(EncryptionMode::Required, &AlwaysFails).is_err());
    }

    #[test]
    fn required_succeeds_with_working_negotiator() {
        let (_, mode) = establish_transport(EncryptionMode::Required, &AlwaysSucceeds).unwrap();
        assert_eq!(mode, TransportMode::Encrypted);
    }
}
