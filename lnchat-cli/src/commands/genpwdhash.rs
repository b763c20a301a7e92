//! Genpwdhash command - hash a management password

use anyhow::{Context, Result};

use crate::{password, ui};

pub fn run() -> Result<()> {
    let password =
        rpassword::prompt_password("Enter password: ").context("Failed to read password")?;

    if password.is_empty() {
        anyhow::bail!("Password cannot be empty");
    }

    let password_confirm = rpassword::prompt_password("Confirm password: ")
        .context("Failed to read password confirmation")?;

    if password != password_confirm {
        anyhow::bail!("Passwords do not match");
    }

    let phc = password::hash_password(&password)?;
    ui::success("Password hashed");
    ui::info("Set it as server.pwdhash (or LNCHAT_SERVER_PWDHASH):");
    println!("{}", phc);
    Ok(())
}
