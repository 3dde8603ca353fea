//! User management CLI.
//!
//! Operates directly on the gateway's user store file; exits 0 on success
//! and 1 on any failure. The store path comes from the same settings surface
//! as the gateway (`USER_DB_PATH` / `GATEWAY_CONFIG`).

use std::io::Write as _;
use std::path::PathBuf;

use clap::{Parser, Subcommand};

use inference_gateway::{
    stores::{FileUserStore, UserStore as _},
    Settings,
};

#[derive(Parser)]
#[command(name = "user-manager", about = "Manage gateway users.")]
struct Cli {
    /// Override the user store file path.
    #[arg(long, env = "USER_DB_PATH")]
    db_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a new user.
    Create {
        username: String,
        /// Create the user as an admin.
        #[arg(long)]
        admin: bool,
        /// Password; prompted for when omitted.
        #[arg(long)]
        password: Option<String>,
    },
    /// Reset a user's password.
    Reset {
        username: String,
        #[arg(long)]
        password: Option<String>,
    },
    /// Disable a user.
    Disable { username: String },
    /// Enable a user.
    Enable { username: String },
    /// List users.
    List,
}

fn prompt_password(label: &str) -> anyhow::Result<String> {
    print!("{label}");
    std::io::stdout().flush()?;
    let mut line = String::new();
    std::io::stdin().read_line(&mut line)?;
    let password = line.trim_end_matches(['\n', '\r']).to_string();
    anyhow::ensure!(!password.is_empty(), "password required");
    Ok(password)
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let db_path = match cli.db_path {
        Some(path) => path,
        None => {
            // Same settings surface as the gateway, but without its bearer
            // validation — the CLI only needs the store path.
            let config_path = std::env::var("GATEWAY_CONFIG")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("gateway.toml"));
            let mut settings = std::fs::read_to_string(&config_path)
                .ok()
                .and_then(|raw| toml::from_str::<Settings>(&raw).ok())
                .unwrap_or_default();
            settings.apply_env_overlay();
            PathBuf::from(settings.user_db_path)
        }
    };
    let store = FileUserStore::new(db_path);

    match cli.command {
        Command::Create { username, admin, password } => {
            let password = match password {
                Some(p) => p,
                None => prompt_password("New password: ")?,
            };
            let user = store.create_user(&username, &password, admin)?;
            println!("created user {} (id={}) admin={}", user.username, user.id, user.admin);
        }
        Command::Reset { username, password } => {
            let password = match password {
                Some(p) => p,
                None => prompt_password("New password: ")?,
            };
            store.set_password(&username, &password)?;
            println!("password updated for {username}");
        }
        Command::Disable { username } => {
            store.set_disabled(&username, true)?;
            println!("disabled user {username}");
        }
        Command::Enable { username } => {
            store.set_disabled(&username, false)?;
            println!("enabled user {username}");
        }
        Command::List => {
            for user in store.list_users()? {
                let status = if user.disabled { "disabled" } else { "active" };
                println!("{}\t{}\t{status}", user.username, user.id);
            }
        }
    }
    Ok(())
}

fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}
