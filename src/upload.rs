//! Single file upload over the `scp` sink protocol.
//!
//! The remote runs `scp -qt <dir>` and reads, on stdin, one header line
//! `C<mode> <size> <name>\n`, then exactly `size` bytes, then a NUL byte.
//! Header, body and terminator are written by one task, strictly in order.

use crate::client::{release, Client};
use crate::error::{Error, ExitStatus, Result, UploadPhase};
use crate::progress::ProgressWriter;
use crate::transport::{BoxWriter, Channel};
use std::borrow::Cow;
use std::io;
use std::path::Path;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::task::JoinHandle;

pub const SCP_PROGRAM: &str = "/usr/bin/scp";

const COPY_BUFFER: usize = 32 * 1024;

/// Where and how an upload lands on the remote side.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransferSpec {
    pub remote_path: String,
    /// Octal mode such as `0644`.
    pub permission: String,
    /// Echo the remote receiver's stdout locally.
    pub debug: bool,
}

impl TransferSpec {
    pub fn new(remote_path: &str, permission: &str) -> Self {
        Self {
            remote_path: remote_path.to_string(),
            permission: permission.to_string(),
            debug: false,
        }
    }

    pub fn debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn validate(&self) -> Result<()> {
        let mode = &self.permission;
        if !(3..=4).contains(&mode.len()) || !mode.bytes().all(|b| (b'0'..=b'7').contains(&b)) {
            return Err(Error::upload(
                UploadPhase::Prepare,
                anyhow::anyhow!("permission {:?} is not an octal mode", mode),
            ));
        }
        let name = remote_basename(&self.remote_path);
        if name == "." || name == "/" || name.contains('\n') {
            return Err(Error::upload(
                UploadPhase::Prepare,
                anyhow::anyhow!("remote path {:?} does not name a file", self.remote_path),
            ));
        }
        Ok(())
    }

    pub fn header(&self, size: u64) -> String {
        format!(
            "C{} {} {}\n",
            self.permission,
            size,
            remote_basename(&self.remote_path)
        )
    }

    pub fn remote_command(&self) -> String {
        let dir = remote_dir(&self.remote_path);
        format!(
            "{} -qt {}",
            SCP_PROGRAM,
            shell_escape::unix::escape(Cow::from(dir))
        )
    }
}

/// Directory part of a remote POSIX path: `"/root/f"` → `"/root"`,
/// `"f"` → `"."`, `"/f"` → `"/"`.
pub fn remote_dir(path: &str) -> String {
    match path.rfind('/') {
        None => ".".to_string(),
        Some(i) => {
            let dir = path[..i].trim_end_matches('/');
            if dir.is_empty() {
                "/".to_string()
            } else {
                dir.to_string()
            }
        }
    }
}

/// Last element of a remote POSIX path, ignoring trailing slashes.
pub fn remote_basename(path: &str) -> String {
    if path.is_empty() {
        return ".".to_string();
    }
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return "/".to_string();
    }
    match trimmed.rfind('/') {
        Some(i) => trimmed[i + 1..].to_string(),
        None => trimmed.to_string(),
    }
}

impl Client {
    /// Upload `local_path` to `remote_path` with mode `permission`.
    pub async fn upload(
        &mut self,
        local_path: impl AsRef<Path>,
        remote_path: &str,
        permission: &str,
        debug: bool,
    ) -> Result<()> {
        let spec = TransferSpec::new(remote_path, permission).debug(debug);
        spec.validate()?;

        let local_path = local_path.as_ref();
        let file = tokio::fs::File::open(local_path)
            .await
            .map_err(|e| Error::upload(UploadPhase::Open, e))?;
        let size = file
            .metadata()
            .await
            .map_err(|e| Error::upload(UploadPhase::Stat, e))?
            .len();

        log::info!(
            "Uploading {} -> {}:{} ({} bytes)",
            local_path.display(),
            self.config().hostname,
            remote_path,
            size
        );
        self.upload_from(BufReader::new(file), size, &spec).await
    }

    /// Upload exactly `size` bytes read from `reader`.
    pub async fn upload_from<R>(&mut self, reader: R, size: u64, spec: &TransferSpec) -> Result<()>
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        spec.validate()?;
        let guard = self.guard();
        let mut channel = guard.run(self.open_session()).await.map_err(|e| match e {
            Error::Session(source) => Error::upload(UploadPhase::Session, source),
            other => other,
        })?;
        let progress = ProgressWriter::new(
            size,
            "Uploading",
            "Uploaded",
            self.progress_display(),
        );
        let result = guard
            .run(run_upload(channel.as_mut(), reader, size, spec, progress))
            .await;
        release(channel).await;
        result?;
        log::info!("Uploaded {}:{}", self.config().hostname, spec.remote_path);
        Ok(())
    }
}

/// Remote `scp` exits 1 after an otherwise complete single-file transfer.
fn upload_succeeded(status: &ExitStatus) -> bool {
    status.success() || status.code() == Some(1)
}

async fn run_upload<R>(
    channel: &mut dyn Channel,
    reader: R,
    size: u64,
    spec: &TransferSpec,
    progress: ProgressWriter,
) -> Result<()>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    let stdin = channel
        .take_stdin()
        .map_err(|e| Error::upload(UploadPhase::Stdin, e))?;
    let mirror = if spec.debug {
        let mut stdout = channel
            .take_stdout()
            .map_err(|e| Error::upload(UploadPhase::Stdout, e))?;
        Some(AbortOnDrop(tokio::spawn(async move {
            let mut local = tokio::io::stdout();
            if let Err(e) = tokio::io::copy(&mut stdout, &mut local).await {
                log::debug!("Remote stdout mirror ended: {}", e);
            }
        })))
    } else {
        None
    };

    channel
        .exec(&spec.remote_command())
        .await
        .map_err(|e| Error::upload(UploadPhase::Start, e))?;

    let mut writer = AbortOnDrop(tokio::spawn(write_scp(
        stdin,
        reader,
        spec.header(size),
        size,
        progress,
    )));

    match channel.wait().await {
        Ok(status) if upload_succeeded(&status) => {
            if !status.success() {
                log::debug!("Treating remote scp {} as success", status);
            }
        }
        Ok(status) => {
            return Err(Error::upload(
                UploadPhase::Wait,
                anyhow::anyhow!("{}", status),
            ))
        }
        Err(e) => return Err(Error::upload(UploadPhase::Wait, e)),
    }

    match (&mut writer.0).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => return Err(Error::upload(UploadPhase::Write, e)),
        Err(e) => return Err(Error::upload(UploadPhase::Write, e)),
    }

    if let Some(mut mirror) = mirror {
        let _ = (&mut mirror.0).await;
    }
    Ok(())
}

/// Aborts the wrapped task when dropped, so no upload task outlives the
/// operation that spawned it.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Write header, body and NUL terminator, then close stdin.
async fn write_scp<R>(
    mut stdin: BoxWriter,
    reader: R,
    header: String,
    size: u64,
    mut progress: ProgressWriter,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
{
    stdin.write_all(header.as_bytes()).await?;

    let mut body = reader.take(size);
    let mut buf = vec![0u8; COPY_BUFFER];
    loop {
        let n = body.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        stdin.write_all(&buf[..n]).await?;
        progress.update(&buf[..n]);
    }
    if progress.transferred() != size {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!(
                "source ended after {} of {} bytes",
                progress.transferred(),
                size
            ),
        ));
    }

    stdin.write_all(&[0]).await?;
    stdin.flush().await?;
    stdin.shutdown().await?;
    progress.stop();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::LogProgress;

    #[test]
    fn test_remote_dir() {
        assert_eq!(remote_dir("/root/hwebhookrouter"), "/root");
        assert_eq!(remote_dir("f.txt"), ".");
        assert_eq!(remote_dir("/f.txt"), "/");
        assert_eq!(remote_dir("a/b/c"), "a/b");
    }

    #[test]
    fn test_remote_basename() {
        assert_eq!(remote_basename("/root/hwebhookrouter"), "hwebhookrouter");
        assert_eq!(remote_basename("f.txt"), "f.txt");
        assert_eq!(remote_basename("/tmp/dir/"), "dir");
        assert_eq!(remote_basename("/"), "/");
        assert_eq!(remote_basename(""), ".");
    }

    #[test]
    fn test_header_and_command() {
        let spec = TransferSpec::new("/tmp/f.txt", "0644");
        assert_eq!(spec.header(12), "C0644 12 f.txt\n");
        assert_eq!(spec.remote_command(), "/usr/bin/scp -qt /tmp");

        let spec = TransferSpec::new("/tmp/my dir/f.txt", "0755");
        assert_eq!(spec.remote_command(), "/usr/bin/scp -qt '/tmp/my dir'");
    }

    #[test]
    fn test_validate() {
        assert!(TransferSpec::new("/tmp/f", "0644").validate().is_ok());
        assert!(TransferSpec::new("/tmp/f", "755").validate().is_ok());
        for bad in ["", "0844", "rw-r--r--", "00644"] {
            let err = TransferSpec::new("/tmp/f", bad).validate().unwrap_err();
            assert_eq!(err.upload_phase(), Some(UploadPhase::Prepare));
        }
        assert!(TransferSpec::new("/", "0644").validate().is_err());
    }

    #[test]
    fn test_exit_one_counts_as_success() {
        assert!(upload_succeeded(&ExitStatus::Code(0)));
        assert!(upload_succeeded(&ExitStatus::Code(1)));
        assert!(!upload_succeeded(&ExitStatus::Code(2)));
        assert!(!upload_succeeded(&ExitStatus::Missing));
    }

    #[tokio::test]
    async fn test_write_scp_rejects_short_source() {
        let progress = ProgressWriter::new(10, "Uploading", "Uploaded", Box::new(LogProgress));
        let sink: BoxWriter = Box::new(tokio::io::sink());
        let err = write_scp(sink, &b"abc"[..], "C0644 10 f\n".to_string(), 10, progress)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
