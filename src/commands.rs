// Command implementations: resolve names through the API client, then hand
// a local/remote stream pair to the chunked engine. Listing output goes on
// stdout; progress and prompts stay on stderr.

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::api::{ApiClient, FileMeta, HttpDownloadTransport, HttpUploadTransport, UploadRequest};
use crate::error::Error;
use crate::progress::ProgressReporter;
use crate::transfer::{Downloader, ProgressEvent, UploadSource, Uploader};

/// Shared per-invocation state handed to every command.
pub struct Context {
    pub client: ApiClient,
    /// Resolved folder id of -p/--parent, if given.
    pub parent: Option<String>,
    /// Chunk size in bytes, already rounded to the minimum-unit multiple.
    pub chunk_size: u64,
    pub verbose: bool,
}

impl Context {
    fn reporter(&self) -> Option<ProgressReporter> {
        self.verbose.then(ProgressReporter::new)
    }
}

/// `get <file>`: download into `output` (default: the remote name), `-`
/// meaning standard output. Refuses to overwrite an existing local file.
pub fn get(ctx: &Context, file: &str, output: Option<&str>) -> Result<(), Error> {
    let local = output.unwrap_or(file);

    // Conflict check before any network traffic or byte is written.
    if local != "-" && Path::new(local).exists() {
        return Err(Error::LocalConflict(PathBuf::from(local)));
    }

    let meta = ctx.client.find_file(file, ctx.parent.as_deref())?;
    let url = meta
        .download_url
        .clone()
        .ok_or_else(|| Error::Protocol(format!("'{}' has no download URL", meta.title)))?;

    let mut out: Box<dyn Write> = if local == "-" {
        Box::new(io::stdout())
    } else {
        // create_new guards against a file that appeared since the check.
        Box::new(
            OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(local)?,
        )
    };

    let transport = HttpDownloadTransport::new(&ctx.client, url, meta.file_size_bytes());
    let mut downloader = Downloader::new(transport, ctx.chunk_size);
    let mut reporter = ctx.reporter();
    downloader.run(&mut out, |ev: &ProgressEvent| {
        if let Some(r) = reporter.as_mut() {
            r.handle(ev);
        }
    })?;
    Ok(())
}

/// `put <file>`: upload under `output` (default: the local base name), `-`
/// meaning standard input.
pub fn put(
    ctx: &Context,
    file: &str,
    output: Option<&str>,
    mime: Option<&str>,
) -> Result<(), Error> {
    let path = Path::new(file);
    let source = if file == "-" {
        UploadSource::stdin()
    } else {
        UploadSource::open(path)?
    };

    let remote = match output {
        Some(name) => name.to_string(),
        None => path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| file.to_string()),
    };
    let mime = match mime {
        Some(m) => m.to_string(),
        None => guess_mime(path).to_string(),
    };

    let request = UploadRequest {
        title: remote,
        mime_type: mime,
        parent: ctx.parent.clone(),
    };
    let transport = HttpUploadTransport::new(&ctx.client, request);
    let mut uploader = Uploader::new(transport, source, ctx.chunk_size);
    let mut reporter = ctx.reporter();
    uploader.run(|ev: &ProgressEvent| {
        if let Some(r) = reporter.as_mut() {
            r.handle(ev);
        }
    })?;
    Ok(())
}

/// `list` and `md5`: enumerate non-trashed, non-folder entries in scope.
pub fn list(ctx: &Context, md5: bool) -> Result<(), Error> {
    for entry in ctx.client.list_files(ctx.parent.as_deref())? {
        if md5 {
            println!("{}", format_md5_line(&entry));
        } else {
            println!("{}", format_list_line(&entry));
        }
    }
    Ok(())
}

/// `trash <file>`: move the unique matching entry to the trash.
pub fn trash(ctx: &Context, file: &str) -> Result<(), Error> {
    let meta = ctx.client.find_file(file, ctx.parent.as_deref())?;
    ctx.client.trash(&meta.id)
}

fn format_list_line(f: &FileMeta) -> String {
    format!(
        "{:<29} {:<19} {:>12} {} {}",
        f.mime_type.as_deref().unwrap_or("-"),
        f.last_modifying_user_name.as_deref().unwrap_or("-"),
        f.file_size_bytes().unwrap_or(0),
        f.modified_date.as_deref().unwrap_or("-"),
        f.title
    )
}

fn format_md5_line(f: &FileMeta) -> String {
    format!("{} *{}", f.md5_checksum.as_deref().unwrap_or("-"), f.title)
}

/// MIME type from the file extension, octet-stream when unknown.
fn guess_mime(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("txt") | Some("log") => "text/plain",
        Some("html") | Some("htm") => "text/html",
        Some("csv") => "text/csv",
        Some("xml") => "application/xml",
        Some("json") => "application/json",
        Some("pdf") => "application/pdf",
        Some("zip") => "application/zip",
        Some("gz") => "application/gzip",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("mp3") => "audio/mpeg",
        Some("mp4") => "video/mp4",
        _ => "application/octet-stream",
    }
}
