// Delegated authorization: OAuth2 authorization-code flow for an installed
// app, with tokens cached on disk under the platform data directory. The
// handshake uses its own plain HTTP client; the retry policy never applies
// to auth.

use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::Error;

pub const APP_NAME: &str = "drivepipe";

const SCOPES: &str = "https://www.googleapis.com/auth/drive.file \
                      https://www.googleapis.com/auth/drive.metadata.readonly";
const OOB_REDIRECT: &str = "urn:ietf:wg:oauth:2.0:oob";

/// Refresh slack: a token this close to expiry counts as expired.
const EXPIRY_SLACK: Duration = Duration::from_secs(60);

/// Google-style "installed app" client secrets file.
#[derive(Debug, Deserialize)]
struct ClientSecrets {
    installed: InstalledApp,
}

#[derive(Debug, Deserialize)]
struct InstalledApp {
    client_id: String,
    client_secret: String,
    #[serde(default = "default_auth_uri")]
    auth_uri: String,
    #[serde(default = "default_token_uri")]
    token_uri: String,
}

fn default_auth_uri() -> String {
    "https://accounts.google.com/o/oauth2/auth".into()
}

fn default_token_uri() -> String {
    "https://oauth2.googleapis.com/token".into()
}

/// Cached credentials, one file per user in the app data dir.
#[derive(Debug, Serialize, Deserialize)]
pub struct StoredToken {
    pub access_token: String,
    pub refresh_token: Option<String>,
    /// Unix timestamp past which the access token is stale.
    pub expires_at: Option<u64>,
}

impl StoredToken {
    fn fresh_at(&self, now: u64) -> bool {
        match self.expires_at {
            Some(at) => now + EXPIRY_SLACK.as_secs() < at,
            None => false,
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Option<u64>,
}

/// Per-user application data directory (`%AppData%`, `~/Library/Application
/// Support`, or XDG data home), namespaced under the app name.
pub fn data_dir() -> Result<PathBuf, Error> {
    dirs::data_dir()
        .map(|d| d.join(APP_NAME))
        .ok_or_else(|| Error::Auth("no application data directory on this platform".into()))
}

/// Obtains a usable access token: cached, refreshed, or via a fresh
/// authorization-code handshake (loopback listener, or manual paste with
/// `--oob`).
pub fn authorize(oob: bool) -> Result<String, Error> {
    let dir = data_dir()?;
    fs::create_dir_all(&dir)?;
    let secrets = load_secrets(&dir.join("client_secrets.json"))?;
    let store = dir.join("tokens.json");

    if let Some(cached) = load_token(&store)? {
        if cached.fresh_at(unix_now()) {
            return Ok(cached.access_token);
        }
        if let Some(refresh_token) = &cached.refresh_token {
            match refresh(&secrets, refresh_token) {
                Ok(token) => {
                    save_token(&store, &token)?;
                    return Ok(token.access_token);
                }
                Err(e) => tracing::debug!("token refresh failed, re-authorizing: {e}"),
            }
        }
    }

    let (code, redirect_uri) = if oob {
        let auth_url = build_auth_url(&secrets, OOB_REDIRECT)?;
        eprintln!("Please open the following URL in your browser:\n\n  {auth_url}\n");
        let code: String = dialoguer::Input::new()
            .with_prompt("Authorization code")
            .interact_text()
            .map_err(|e| Error::Auth(format!("could not read authorization code: {e}")))?;
        (code, OOB_REDIRECT.to_string())
    } else {
        loopback_flow(&secrets)?
    };

    let token = exchange_code(&secrets, &code, &redirect_uri)?;
    save_token(&store, &token)?;
    Ok(token.access_token)
}

fn load_secrets(path: &Path) -> Result<ClientSecrets, Error> {
    let data = fs::read_to_string(path).map_err(|e| {
        Error::Auth(format!(
            "cannot read client secrets at '{}': {e}",
            path.display()
        ))
    })?;
    serde_json::from_str(&data)
        .map_err(|e| Error::Auth(format!("malformed client secrets: {e}")))
}

fn load_token(path: &Path) -> Result<Option<StoredToken>, Error> {
    match fs::read_to_string(path) {
        Ok(data) => Ok(Some(serde_json::from_str(&data)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn save_token(path: &Path, token: &StoredToken) -> Result<(), Error> {
    fs::write(path, serde_json::to_vec_pretty(token)?)?;
    Ok(())
}

fn build_auth_url(secrets: &ClientSecrets, redirect_uri: &str) -> Result<String, Error> {
    let mut url = Url::parse(&secrets.installed.auth_uri)
        .map_err(|e| Error::Auth(format!("bad auth URI: {e}")))?;
    url.query_pairs_mut()
        .append_pair("client_id", &secrets.installed.client_id)
        .append_pair("redirect_uri", redirect_uri)
        .append_pair("response_type", "code")
        .append_pair("scope", &SCOPES.split_whitespace().collect::<Vec<_>>().join(" "))
        .append_pair("access_type", "offline");
    Ok(url.into())
}

/// Catches the authorization code on a loopback listener, the default for
/// interactive use.
fn loopback_flow(secrets: &ClientSecrets) -> Result<(String, String), Error> {
    let listener = TcpListener::bind(("127.0.0.1", 0))?;
    let redirect_uri = format!("http://127.0.0.1:{}", listener.local_addr()?.port());
    let auth_url = build_auth_url(secrets, &redirect_uri)?;
    eprintln!("Please open the following URL in your browser:\n\n  {auth_url}\n");
    eprintln!("Waiting for authorization ...");

    let (stream, _) = listener.accept()?;
    let mut reader = BufReader::new(stream);
    let mut request_line = String::new();
    reader.read_line(&mut request_line)?;
    let code = code_from_request_line(&request_line)?;

    let mut stream = reader.into_inner();
    stream.write_all(
        b"HTTP/1.1 200 OK\r\nContent-Type: text/html\r\n\r\n\
          <html><body>Authorization received. You may close this window.</body></html>",
    )?;

    Ok((code, redirect_uri))
}

/// Extracts the `code` parameter from the redirect's HTTP request line.
fn code_from_request_line(line: &str) -> Result<String, Error> {
    let path = line
        .split_whitespace()
        .nth(1)
        .ok_or_else(|| Error::Auth("malformed redirect request".into()))?;
    let url = Url::parse(&format!("http://localhost{path}"))
        .map_err(|e| Error::Auth(format!("malformed redirect request: {e}")))?;

    if let Some((_, reason)) = url.query_pairs().find(|(k, _)| k == "error") {
        return Err(Error::Auth(format!("authorization denied: {reason}")));
    }
    url.query_pairs()
        .find(|(k, _)| k == "code")
        .map(|(_, v)| v.into_owned())
        .ok_or_else(|| Error::Auth("redirect carried no authorization code".into()))
}

fn exchange_code(
    secrets: &ClientSecrets,
    code: &str,
    redirect_uri: &str,
) -> Result<StoredToken, Error> {
    token_request(
        secrets,
        &[
            ("code", code),
            ("client_id", &secrets.installed.client_id),
            ("client_secret", &secrets.installed.client_secret),
            ("redirect_uri", redirect_uri),
            ("grant_type", "authorization_code"),
        ],
        None,
    )
}

fn refresh(secrets: &ClientSecrets, refresh_token: &str) -> Result<StoredToken, Error> {
    token_request(
        secrets,
        &[
            ("refresh_token", refresh_token),
            ("client_id", &secrets.installed.client_id),
            ("client_secret", &secrets.installed.client_secret),
            ("grant_type", "refresh_token"),
        ],
        // A refresh response usually omits the refresh token; keep the old one.
        Some(refresh_token.to_string()),
    )
}

fn token_request(
    secrets: &ClientSecrets,
    form: &[(&str, &str)],
    fallback_refresh: Option<String>,
) -> Result<StoredToken, Error> {
    let http = reqwest::blocking::Client::new();
    let resp = http
        .post(&secrets.installed.token_uri)
        .form(form)
        .send()
        .map_err(|e| Error::Auth(format!("token endpoint unreachable: {e}")))?;

    if !resp.status().is_success() {
        let status = resp.status();
        let body = resp.text().unwrap_or_default();
        return Err(Error::Auth(format!(
            "token endpoint returned {status}: {}",
            body.trim()
        )));
    }

    let parsed: TokenResponse = resp
        .json()
        .map_err(|e| Error::Auth(format!("malformed token response: {e}")))?;
    Ok(StoredToken {
        access_token: parsed.access_token,
        refresh_token: parsed.refresh_token.or(fallback_refresh),
        expires_at: parsed.expires_in.map(|secs| unix_now() + secs),
    })
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
