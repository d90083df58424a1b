use crate::config::{Config, KeyLocation};
use crate::footer::{CryptType, EncryptionFooter, Flags};
use crate::kdf::KdfKind;
use crate::keystore::Keystore;
use crate::props::{MemoryProperties, CRYPTO_STATE};
use crate::verifier::{Cryptfs, Verdict};
use clap::{Parser, Subcommand};
use eyre::{bail, Result, WrapErr};
use std::env;
use std::path::PathBuf;
use zeroize::Zeroizing;

const TPM_ENV_VAR: &str = "TCTI";
const CONFIG_ENV_VAR: &str = "CRYPTFS_CONFIG";
const PASSWORD_ENV_VAR: &str = "CRYPTFS_PASSWORD";
const VOLUME_KEY_ENV_VAR: &str = "CRYPTFS_VOLUME_KEY";

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// YAML config file, built-in defaults when absent
    #[arg(short, long, value_name = "FILE", env = CONFIG_ENV_VAR)]
    config: Option<PathBuf>,

    /// `footer` or the path of a dedicated key file
    #[arg(short, long, value_name = "LOCATION")]
    key_location: Option<KeyLocation>,

    /// Raw encrypted partition
    #[arg(short, long, value_name = "DEVICE")]
    blkdev: Option<PathBuf>,

    /// TPM device specified in TCTI format
    #[arg(short = 'T', long, default_value = "device:/dev/tpmrm0", env = TPM_ENV_VAR)]
    tcti: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Check a password and map the decrypted device on success
    Check {
        #[arg(env = PASSWORD_ENV_VAR, hide_env_values = true)]
        password: String,
    },
    /// Show what kind of credential unlocks the device
    PasswordType,
    /// Map an external volume with a caller supplied key
    SetupVolume {
        /// dm-crypt device name
        #[arg(value_name = "name")]
        label: String,
        #[arg(value_name = "device")]
        real_blkdev: PathBuf,
        /// Key as hex
        #[arg(value_name = "key", env = VOLUME_KEY_ENV_VAR, hide_env_values = true)]
        key: String,
        /// Key bytes to use, defaults to the whole key
        #[arg(short = 's', long)]
        keysize: Option<usize>,
    },
    /// Remove a mapping created by `setup-volume`
    RevertVolume {
        #[arg(value_name = "name")]
        label: String,
    },
    /// Print the crypto footer, without key material
    ShowFooter,
}

impl Cli {
    pub fn new() -> Self {
        let cli = Cli::parse();
        env::set_var(TPM_ENV_VAR, &cli.tcti);
        cli
    }

    fn config(&self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::from_path(path)?,
            None => Config::default(),
        };
        if let Some(key_location) = &self.key_location {
            config.key_location = key_location.clone();
        }
        if let Some(blkdev) = &self.blkdev {
            config.real_blkdev = blkdev.clone();
        }
        log::debug!("{:?}", config);
        Ok(config)
    }

    fn cryptfs(&self) -> Result<Cryptfs> {
        Ok(Cryptfs::new(self.config()?)
            .with_oracle(Keystore::probe())
            .with_properties(MemoryProperties::default().with(CRYPTO_STATE, "encrypted")))
    }

    pub fn run(&self) -> Result<&Self> {
        match &self.command {
            Commands::Check { password } => self.check(password)?,
            Commands::PasswordType => {
                let password_type = self.cryptfs()?.get_password_type()?;
                println!("{}", password_type_name(password_type));
            }
            Commands::SetupVolume {
                label,
                real_blkdev,
                key,
                keysize,
            } => {
                let key = Zeroizing::new(hex::decode(key).wrap_err("key is not valid hex")?);
                let keysize = keysize.unwrap_or(key.len());
                let path = self
                    .cryptfs()?
                    .setup_external_volume(label, real_blkdev, &key, keysize)?;
                println!("{}", path.display());
            }
            Commands::RevertVolume { label } => self.cryptfs()?.revert_external_volume(label)?,
            Commands::ShowFooter => show_footer(&self.cryptfs()?.footer()?),
        };
        Ok(self)
    }

    fn check(&self, password: &str) -> Result<()> {
        let cryptfs = self.cryptfs()?;
        match cryptfs.check_password(password.as_bytes())? {
            Verdict::Match => {
                if let Some(device) = cryptfs.crypto_blkdev() {
                    println!("{}", device.display());
                }
                Ok(())
            }
            Verdict::Mismatch { failed_attempts } => {
                bail!("Password does not match, {} failed attempts", failed_attempts)
            }
        }
    }
}

fn password_type_name(password_type: CryptType) -> &'static str {
    match password_type {
        CryptType::Password => "password",
        CryptType::Pattern => "pattern",
        CryptType::Pin => "pin",
        CryptType::Default => "default",
    }
}

fn show_footer(footer: &EncryptionFooter) {
    let kdf = KdfKind::try_from(footer.kdf_type)
        .map(|kind| format!("{kind:?}"))
        .unwrap_or_else(|e| e.to_string());
    let password_type = footer
        .password_type()
        .map(password_type_name)
        .unwrap_or("unknown");
    println!("version:          {}.{}", footer.major_version, footer.minor_version);
    println!("flags:            {:#x}", footer.flags.bits());
    if footer.flags.contains(Flags::ENCRYPTION_IN_PROGRESS) {
        println!(
            "                  encryption in progress, {} sectors done",
            footer.encrypted_upto
        );
    }
    println!("password type:    {}", password_type);
    println!("cipher:           {}", footer.cipher_name());
    println!("keysize:          {}", footer.keysize);
    println!("fs size:          {} sectors", footer.fs_size);
    println!("failed attempts:  {}", footer.failed_decrypt_count);
    println!(
        "kdf:              {} (N=2^{}, r=2^{}, p=2^{})",
        kdf, footer.n_factor, footer.r_factor, footer.p_factor
    );
    println!("key blob:         {} bytes", footer.keymaster_blob_size);
    println!("checksum valid:   {}", footer.checksum_is_valid());
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use eyre::Result;

    #[test]
    fn verify_cli() {
        Cli::command().debug_assert();
    }

    #[test]
    fn overrides_replace_config() -> Result<()> {
        let cli = Cli::try_parse_from([
            "cryptfs",
            "--key-location",
            "/metadata/key_file",
            "--blkdev",
            "/dev/sda2",
            "password-type",
        ])?;
        let config = cli.config()?;
        assert_eq!(
            config.key_location,
            KeyLocation::File("/metadata/key_file".into())
        );
        assert_eq!(config.real_blkdev, PathBuf::from("/dev/sda2"));
        assert_eq!(config.label, "userdata");
        Ok(())
    }

    #[test]
    fn footer_sentinel_on_command_line() -> Result<()> {
        let cli = Cli::try_parse_from(["cryptfs", "-k", "footer", "show-footer"])?;
        assert_eq!(cli.config()?.key_location, KeyLocation::Footer);
        Ok(())
    }

    #[test]
    fn setup_volume_args() -> Result<()> {
        let cli = Cli::try_parse_from([
            "cryptfs",
            "setup-volume",
            "sdcard",
            "/dev/block/mmcblk1p1",
            "00112233445566778899aabbccddeeff",
            "--keysize",
            "16",
        ])?;
        assert!(matches!(
            cli.command,
            Commands::SetupVolume {
                keysize: Some(16),
                ..
            }
        ));
        Ok(())
    }
}
