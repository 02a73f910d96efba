use std::io::{self, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use relay_core::model::Connection;
use ssh2::{Session, Sftp};

use crate::deploy::{DeployError, RemoteFs};

/// An authenticated SSH session. Disconnects on drop.
///
/// The server host key is accepted without verification.
pub struct SshSession {
    session: Session,
    host: String,
}

impl SshSession {
    pub fn connect(conn: &Connection, timeout: Duration) -> Result<Self, DeployError> {
        let endpoint = format!("{}:{}", conn.host, conn.port);
        let addrs = (conn.host.as_str(), conn.port)
            .to_socket_addrs()
            .map_err(|e| DeployError::Connect(format!("resolve {endpoint}: {e}")))?;

        let mut last_err = None;
        let mut tcp = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, timeout) {
                Ok(stream) => {
                    tcp = Some(stream);
                    break;
                }
                Err(e) => last_err = Some(e),
            }
        }
        let tcp = tcp.ok_or_else(|| {
            DeployError::Connect(match last_err {
                Some(e) => format!("{endpoint}: {e}"),
                None => format!("{endpoint}: no addresses"),
            })
        })?;
        tcp.set_read_timeout(Some(timeout)).ok();
        tcp.set_write_timeout(Some(timeout)).ok();

        let mut session =
            Session::new().map_err(|e| DeployError::Connect(format!("ssh session: {e}")))?;
        session.set_tcp_stream(tcp);
        session.set_timeout(u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX));
        session
            .handshake()
            .map_err(|e| DeployError::Connect(format!("ssh handshake with {endpoint}: {e}")))?;

        session
            .userauth_password(&conn.username, &conn.secret)
            .map_err(|e| DeployError::Auth(format!("{}@{endpoint}: {e}", conn.username)))?;
        if !session.authenticated() {
            return Err(DeployError::Auth(format!("{}@{endpoint}", conn.username)));
        }

        tracing::debug!(host = %conn.host, user = %conn.username, "ssh session established");
        Ok(Self {
            session,
            host: conn.host.clone(),
        })
    }

    pub fn sftp(&self) -> Result<SftpFs, DeployError> {
        self.session
            .sftp()
            .map(|sftp| SftpFs { sftp })
            .map_err(|e| DeployError::Connect(format!("sftp subsystem on {}: {e}", self.host)))
    }
}

impl Drop for SshSession {
    fn drop(&mut self) {
        if let Err(e) = self.session.disconnect(None, "relay task finished", None) {
            tracing::debug!(host = %self.host, "ssh disconnect: {e}");
        }
    }
}

/// [`RemoteFs`] over the SFTP subsystem.
pub struct SftpFs {
    sftp: Sftp,
}

impl RemoteFs for SftpFs {
    fn ensure_dir(&mut self, path: &str) -> io::Result<()> {
        let mut current = PathBuf::new();
        for part in Path::new(path).components() {
            current.push(part);
            if matches!(part, Component::RootDir | Component::CurDir | Component::Prefix(_)) {
                continue;
            }
            match self.sftp.stat(&current) {
                Ok(stat) if stat.is_dir() => continue,
                Ok(_) => {
                    return Err(io::Error::new(
                        io::ErrorKind::AlreadyExists,
                        format!("{} exists and is not a directory", current.display()),
                    ))
                }
                Err(_) => {
                    if let Err(e) = self.sftp.mkdir(&current, 0o755) {
                        // Lost a race with another writer; fine if it is a directory now.
                        let now_dir = self.sftp.stat(&current).map(|s| s.is_dir()).unwrap_or(false);
                        if !now_dir {
                            return Err(e.into());
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn write_file(&mut self, path: &str, content: &[u8]) -> io::Result<()> {
        let mut file = self.sftp.create(Path::new(path))?;
        file.write_all(content)?;
        file.flush()
    }

    fn exists(&mut self, path: &str) -> io::Result<bool> {
        match self.sftp.stat(Path::new(path)) {
            Ok(_) => Ok(true),
            Err(err) => {
                let io_err: io::Error = err.into();
                if io_err.kind() == io::ErrorKind::NotFound {
                    Ok(false)
                } else {
                    Err(io_err)
                }
            }
        }
    }

    fn remove_file(&mut self, path: &str) -> io::Result<bool> {
        match self.sftp.unlink(Path::new(path)) {
            Ok(()) => Ok(true),
            Err(err) => {
                let io_err: io::Error = err.into();
                if io_err.kind() == io::ErrorKind::NotFound {
                    Ok(false)
                } else {
                    Err(io_err)
                }
            }
        }
    }
}
