//! TPM 2.0 backed signing.
//!
//! The key blob stored in the footer is the marshalled public area of an
//! RSA 2048 decryption key, prefixed with its length as a little-endian
//! `u32`, followed by the private area. It is loaded under a primary key in
//! the owner hierarchy and used for a raw private key operation.

use super::{Result, Signature, SigningError, SigningOracle};

#[cfg(feature = "tpm")]
pub use self::device::TpmKeystore;
#[cfg(not(feature = "tpm"))]
pub use self::unsupported::TpmKeystore;

#[cfg(feature = "tpm")]
mod device {
    use super::*;
    use once_cell::sync::OnceCell;
    use std::ops::{Deref, DerefMut};
    use std::sync::{Mutex, MutexGuard};
    use tss_esapi::attributes::ObjectAttributes;
    use tss_esapi::constants::property_tag::PropertyTag;
    use tss_esapi::handles::KeyHandle;
    use tss_esapi::interface_types::algorithm::{HashingAlgorithm, PublicAlgorithm};
    use tss_esapi::interface_types::ecc::EccCurve;
    use tss_esapi::interface_types::key_bits::RsaKeyBits;
    use tss_esapi::interface_types::resource_handles::Hierarchy;
    use tss_esapi::structures::{
        CreateKeyResult, CreatePrimaryKeyResult, Data, EccPoint, Private, Public,
        PublicEccParametersBuilder, PublicKeyRsa, PublicRsaParametersBuilder,
        RsaDecryptionScheme, RsaExponent, RsaScheme, SymmetricDefinitionObject,
    };
    use tss_esapi::tcti_ldr::TctiNameConf;
    use tss_esapi::traits::{Marshall, UnMarshall};
    use zeroize::Zeroizing;

    // TPM warnings that clear up if the command is sent again later
    const RC_YIELDED: u32 = 0x908;
    const RC_LOCKOUT: u32 = 0x921;
    const RC_RETRY: u32 = 0x922;

    impl From<tss_esapi::Error> for SigningError {
        fn from(e: tss_esapi::Error) -> Self {
            if let tss_esapi::Error::TssError(rc) = e {
                if matches!(u32::from(rc) & 0xffff, RC_YIELDED | RC_LOCKOUT | RC_RETRY) {
                    return SigningError::RateLimited;
                }
            }
            SigningError::Backend(e.to_string())
        }
    }

    static CONTEXT: OnceCell<Mutex<tss_esapi::Context>> = OnceCell::new();

    fn context() -> Result<&'static Mutex<tss_esapi::Context>> {
        CONTEXT.get_or_try_init(|| {
            let conf = TctiNameConf::from_environment_variable()?;
            log::debug!("TCTI config {:?}", conf);
            Ok(Mutex::new(tss_esapi::Context::new(conf)?))
        })
    }

    /// Primary key that is flushed when dropped.
    struct PrimaryKey<'a> {
        ctx: MutexGuard<'a, tss_esapi::Context>,
        key: KeyHandle,
    }

    impl Deref for PrimaryKey<'_> {
        type Target = tss_esapi::Context;
        fn deref(&self) -> &Self::Target {
            &self.ctx
        }
    }

    impl DerefMut for PrimaryKey<'_> {
        fn deref_mut(&mut self) -> &mut Self::Target {
            &mut self.ctx
        }
    }

    impl Drop for PrimaryKey<'_> {
        fn drop(&mut self) {
            self.ctx.flush_context(self.key.into()).ok();
        }
    }

    #[derive(Debug)]
    pub struct TpmKeystore {
        ctx: &'static Mutex<tss_esapi::Context>,
    }

    impl TpmKeystore {
        /// Connects using the `TCTI` environment variable and checks the
        /// TPM answers.
        pub fn open() -> Result<Self> {
            let keystore = Self { ctx: context()? };
            let revision = keystore.lock()?.get_tpm_property(PropertyTag::Revision)?;
            log::debug!("TPM revision {:?}", revision);
            Ok(keystore)
        }

        fn lock(&self) -> Result<MutexGuard<'static, tss_esapi::Context>> {
            self.ctx
                .lock()
                .map_err(|_| SigningError::Backend("TPM context poisoned".into()))
        }

        fn create_primary(&self) -> Result<PrimaryKey<'static>> {
            let mut ctx = self.lock()?;
            let object_attributes = ObjectAttributes::builder()
                .with_fixed_tpm(true)
                .with_fixed_parent(true)
                .with_sensitive_data_origin(true)
                .with_user_with_auth(true)
                .with_decrypt(true)
                .with_sign_encrypt(false)
                .with_restricted(true)
                .build()?;

            let public = Public::builder()
                .with_public_algorithm(PublicAlgorithm::Ecc)
                .with_name_hashing_algorithm(HashingAlgorithm::Sha256)
                .with_object_attributes(object_attributes)
                .with_ecc_parameters(
                    PublicEccParametersBuilder::new_restricted_decryption_key(
                        SymmetricDefinitionObject::AES_128_CFB,
                        EccCurve::NistP256,
                    )
                    .build()?,
                )
                .with_ecc_unique_identifier(EccPoint::default())
                .build()?;

            let CreatePrimaryKeyResult {
                key_handle: key, ..
            } = ctx.execute_with_nullauth_session(|ctx| {
                ctx.create_primary(Hierarchy::Owner, public, None, None, None, None)
            })?;
            Ok(PrimaryKey { ctx, key })
        }

        /// Creates a fresh device-bound RSA key and returns its footer blob.
        pub fn enroll_key(&self) -> Result<Vec<u8>> {
            let mut primary = self.create_primary()?;
            let parent = primary.key;

            let object_attributes = ObjectAttributes::builder()
                .with_fixed_tpm(true)
                .with_fixed_parent(true)
                .with_sensitive_data_origin(true)
                .with_user_with_auth(true)
                .with_decrypt(true)
                .with_sign_encrypt(true)
                .with_restricted(false)
                .build()?;

            let public = Public::builder()
                .with_public_algorithm(PublicAlgorithm::Rsa)
                .with_name_hashing_algorithm(HashingAlgorithm::Sha256)
                .with_object_attributes(object_attributes)
                .with_rsa_parameters(
                    PublicRsaParametersBuilder::new()
                        .with_scheme(RsaScheme::Null)
                        .with_key_bits(RsaKeyBits::Rsa2048)
                        .with_exponent(RsaExponent::default())
                        .with_is_decryption_key(true)
                        .with_is_signing_key(true)
                        .with_restricted(false)
                        .build()?,
                )
                .with_rsa_unique_identifier(PublicKeyRsa::default())
                .build()?;

            let CreateKeyResult {
                out_private,
                out_public,
                ..
            } = primary.execute_with_nullauth_session(|ctx| {
                ctx.create(parent, public, None, None, None, None)
            })?;
            join_blob(&out_public, &out_private)
        }
    }

    fn join_blob(public: &Public, private: &Private) -> Result<Vec<u8>> {
        let public = public.marshall()?;
        let len = u32::try_from(public.len()).map_err(|_| SigningError::InvalidKeyBlob)?;
        let mut blob = len.to_le_bytes().to_vec();
        blob.extend_from_slice(&public);
        blob.extend_from_slice(private.value());
        Ok(blob)
    }

    fn split_blob(blob: &[u8]) -> Result<(Public, Private)> {
        let len: [u8; 4] = blob
            .get(..4)
            .and_then(|b| b.try_into().ok())
            .ok_or(SigningError::InvalidKeyBlob)?;
        let end = usize::try_from(u32::from_le_bytes(len))
            .ok()
            .and_then(|len| len.checked_add(4))
            .ok_or(SigningError::InvalidKeyBlob)?;
        let public = blob.get(4..end).ok_or(SigningError::InvalidKeyBlob)?;
        let private = &blob[end..];
        let public = Public::unmarshall(public).map_err(|_| SigningError::InvalidKeyBlob)?;
        let private =
            Private::try_from(private.to_vec()).map_err(|_| SigningError::InvalidKeyBlob)?;
        Ok((public, private))
    }

    impl SigningOracle for TpmKeystore {
        fn sign_block(&self, key_blob: &[u8], block: &[u8]) -> Result<Signature> {
            let (public, private) = split_blob(key_blob)?;
            let input = PublicKeyRsa::try_from(block.to_vec())?;
            let mut primary = self.create_primary()?;
            let parent = primary.key;

            let key = primary
                .execute_with_nullauth_session(|ctx| ctx.load(parent, private, public))?;
            let out: tss_esapi::Result<PublicKeyRsa> =
                primary.execute_with_nullauth_session(|ctx| {
                    ctx.rsa_decrypt(key, input, RsaDecryptionScheme::Null, Data::default())
                });
            primary.flush_context(key.into()).ok();
            Ok(Zeroizing::new(out?.value().to_vec()))
        }
    }

}

#[cfg(not(feature = "tpm"))]
mod unsupported {
    use super::*;

    /// Stand-in when built without TPM support.
    #[derive(Debug)]
    pub struct TpmKeystore(());

    impl TpmKeystore {
        pub fn open() -> Result<Self> {
            Err(SigningError::Unavailable)
        }
    }

    impl SigningOracle for TpmKeystore {
        fn sign_block(&self, _key_blob: &[u8], _block: &[u8]) -> Result<Signature> {
            Err(SigningError::Unavailable)
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn open_fails() {
            assert!(matches!(TpmKeystore::open(), Err(SigningError::Unavailable)));
        }
    }
}
