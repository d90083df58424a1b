//! # cryptfs
//!
//! Unlocks a block device encrypted with a key stored in an on-disk crypto
//! footer, and maps the decrypted view with dm-crypt.
//!
//! ```no_run
//! use cryptfs::{Config, Cryptfs, Verdict};
//!
//! # fn main() -> eyre::Result<()> {
//! let cryptfs = Cryptfs::new(Config::from_path("/etc/cryptfs.yaml")?);
//! if let Verdict::Match = cryptfs.check_password(b"hunter2")? {
//!     println!("{:?}", cryptfs.crypto_blkdev());
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## With a hardware keystore:
//! ```bash
//! cargo build --release --features tpm
//! ```

pub mod blkdev;
pub mod cli;
pub mod config;
pub mod dm;
pub mod footer;
pub mod inline;
pub mod kdf;
pub mod keystore;
pub mod master_key;
pub mod mount;
pub mod props;
pub mod verifier;

#[cfg(test)]
mod testing;

pub use config::{Config, KeyLocation};
pub use footer::{CryptType, EncryptionFooter};
pub use verifier::{Cryptfs, CryptfsError, Reverify, Verdict};
