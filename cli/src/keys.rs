//! `autopoiesis keys` subcommands.

use autopoiesis_core::approval::keys::ApprovalKeyManager;
use autopoiesis_core::workspace::resolve_agent_name;
use autopoiesis_core::workspace::resolve_agent_workspace;

use crate::cli::KeysArgs;
use crate::cli::KeysCommand;

pub fn run_keys(args: KeysArgs) -> anyhow::Result<i32> {
    let agent = resolve_agent_name(args.agent.as_deref());
    let paths = resolve_agent_workspace(Some(&agent))?;
    paths.ensure_layout()?;
    let manager = ApprovalKeyManager::open(&paths.keys)?;

    match args.command {
        KeysCommand::Init => {
            let passphrase = read_passphrase(true)?;
            let key_id = manager.create_initial_key(&passphrase)?;
            println!("Created signing key {key_id} for agent '{agent}'.");
        }
        KeysCommand::Rotate => {
            let passphrase = read_passphrase(false)?;
            let key_id = manager.rotate(&passphrase)?;
            println!("Rotated to signing key {key_id}; prior keys remain verifiable.");
        }
        KeysCommand::Show => match manager.current_key_id() {
            Ok(key_id) => println!("Current signing key for agent '{agent}': {key_id}"),
            Err(_) => println!(
                "Agent '{agent}' has no approval keyring. Run `autopoiesis keys init`."
            ),
        },
    }
    Ok(0)
}

fn read_passphrase(confirm: bool) -> anyhow::Result<String> {
    let passphrase = prompt_line("Signing passphrase: ")?;
    if passphrase.is_empty() {
        anyhow::bail!("passphrase must not be empty");
    }
    if confirm {
        let again = prompt_line("Confirm passphrase: ")?;
        if passphrase != again {
            anyhow::bail!("passphrases do not match");
        }
    }
    Ok(passphrase)
}

fn prompt_line(prompt: &str) -> anyhow::Result<String> {
    use std::io::Write;
    eprint!("{prompt}");
    std::io::stderr().flush()?;
    let mut line = String::new();
    std::io::stdin().read_line(&mut line)?;
    Ok(line.trim_end_matches('\n').to_string())
}
