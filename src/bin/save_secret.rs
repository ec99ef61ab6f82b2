//! Set or check the secret file used by the oracle signer.
//!
//! Check mode (default) decrypts an existing file and prints the derived
//! keys. Set mode prompts for a seed phrase and writes a new file; an
//! existing file is never overwritten.

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::io::{BufRead, Write};
use std::path::Path;

use attestor_backend::crypto::{secret_file, KeySigner, Network};

#[derive(Parser)]
#[command(
    name = "attestor-secret",
    about = "Set or check the secret file used by the oracle signer"
)]
struct Args {
    /// Prompt for a seed phrase and save the secret. Default is to only
    /// check the file and print the public keys.
    #[arg(long)]
    set: bool,
    /// Secret file to use.
    #[arg(long, default_value = "secret.sec")]
    file: String,
    /// Assume the signet network. Default is mainnet.
    #[arg(long)]
    signet: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let network = if args.signet {
        Network::Signet
    } else {
        Network::Mainnet
    };
    println!(
        "Mode: {}   File: {}   Network: {network}",
        if args.set { "Set" } else { "Check only" },
        args.file
    );

    if args.set {
        do_set(&args.file, network)
    } else {
        do_check(&args.file)
    }
}

fn prompt(label: &str) -> Result<String> {
    print!("{label}: ");
    std::io::stdout().flush()?;
    let mut line = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut line)
        .context("read stdin")?;
    Ok(line.trim().to_string())
}

fn print_keys(entropy: &[u8], network: Network) -> Result<()> {
    let signer = KeySigner::init(entropy, network)?;
    println!("Keys for network {network} ({}):", network.derivation_path());
    println!("  xpub:       {}", signer.xpub());
    println!("  pubkey 0:   {}", signer.public_key(0)?);
    Ok(())
}

fn do_check(file: &str) -> Result<()> {
    let password = prompt("Enter the file encryption password")?;
    let payload = secret_file::load(file, &password)?;
    print_keys(&payload.entropy, payload.network)
}

fn do_set(file: &str, network: Network) -> Result<()> {
    if Path::new(file).exists() {
        bail!("file {file} already exists, won't overwrite");
    }

    let phrase = prompt("Enter the seed phrase")?;
    let mnemonic = bip39::Mnemonic::parse(&phrase).context("invalid seed phrase")?;
    let entropy = mnemonic.to_entropy();
    print_keys(&entropy, network)?;

    let password = prompt("Enter the file encryption password")?;
    let password_repeat = prompt("Re-enter the encryption password")?;
    if password != password_repeat {
        bail!("passwords don't match, try again");
    }

    let payload = secret_file::generate_payload(&entropy, network, &password)?;
    std::fs::write(file, payload).with_context(|| format!("write {file}"))?;
    println!("Secret written to file {file}");
    Ok(())
}
