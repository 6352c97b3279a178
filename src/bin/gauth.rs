use std::ffi::CString;
use std::io::Write;
use std::process::ExitCode;

use anyhow::{Context, Result};

use gdfs_rs::auth::{exchange_auth_code, save_auth_file};
use gdfs_rs::config::{Config, CLIENT_ID, REDIRECT_URI, LOG_FILE};

fn oauth_url() -> String {
    format!(
        "https://accounts.google.com/o/oauth2/auth?response_type=code\
         &scope=https://www.googleapis.com/auth/drive&access_type=offline\
         &client_id={CLIENT_ID}&redirect_uri={REDIRECT_URI}"
    )
}

/// (uid, gid) of a local user.
fn lookup_user(name: &str) -> Result<(u32, u32)> {
    if name == "root" {
        return Ok((0, 0));
    }
    let c_name = CString::new(name).context("user name contains NUL")?;
    let pwd = unsafe { libc::getpwnam(c_name.as_ptr()) };
    if pwd.is_null() {
        anyhow::bail!("unable to resolve user {name}");
    }
    let pwd = unsafe { &*pwd };
    Ok((pwd.pw_uid, pwd.pw_gid))
}

fn chown_path(path: &std::path::Path, uid: u32, gid: u32) -> Result<()> {
    let c_path = CString::new(path.to_string_lossy().as_bytes()).context("path contains NUL")?;
    let rc = unsafe { libc::chown(c_path.as_ptr(), uid, gid) };
    if rc != 0 {
        anyhow::bail!("chown {} failed: {}", path.display(), std::io::Error::last_os_error());
    }
    Ok(())
}

async fn run() -> Result<()> {
    if unsafe { libc::geteuid() } != 0 {
        anyhow::bail!("run gauth as the root user");
    }

    let cfg = Config::load(None).context("load configuration")?;
    std::fs::create_dir_all(&cfg.conf_dir)
        .with_context(|| format!("create {}", cfg.conf_dir.display()))?;
    let (uid, gid) = lookup_user(&cfg.mount_user)
        .with_context(|| format!("resolve gdfs.mount.user={}", cfg.mount_user))?;

    let url = oauth_url();
    println!("To authorize gdfs to use your Google Drive account, visit the");
    println!("following URL and produce an auth code:\n\n{url}\n");
    // Best effort; the URL is printed either way.
    let _ = std::process::Command::new("xdg-open")
        .arg(&url)
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn();

    print!("Enter the auth code: ");
    std::io::stdout().flush().ok();
    let mut code = String::new();
    std::io::stdin()
        .read_line(&mut code)
        .context("read auth code")?;
    let code = code.trim();
    if code.is_empty() {
        anyhow::bail!("no auth code supplied");
    }

    let http = reqwest::Client::new();
    let record = exchange_auth_code(&http, &cfg.oauth_token_url, code)
        .await
        .context("exchange auth code")?;

    let auth_path = cfg.auth_file();
    save_auth_file(&auth_path, &record).context("write auth file")?;
    chown_path(&auth_path, uid, gid)?;
    println!("\nAccess token stored in {}", auth_path.display());

    // Pre-create the log file so the mount user can write it.
    let log_path = cfg.conf_dir.join(LOG_FILE);
    std::fs::File::create(&log_path)
        .with_context(|| format!("create {}", log_path.display()))?;
    chown_path(&log_path, uid, gid)?;

    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("[ERROR] {err:#}");
            ExitCode::from(1)
        }
    }
}
