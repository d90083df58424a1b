/// To build a static binary for the recovery ramdisk:
/// ```
/// rustup target add x86_64-unknown-linux-musl
/// CRYPTFS_BUILD_STATIC=1 cargo build --release --target=x86_64-unknown-linux-musl
/// ```
use cryptfs::cli::Cli;
use eyre::Result;

fn main() -> Result<()> {
    let cli = Cli::new();
    env_logger::init_from_env(
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"),
    );
    #[cfg(feature = "tpm")]
    std::env::set_var("TSS2_LOG", "all+NONE");
    cli.run()?;
    Ok(())
}
