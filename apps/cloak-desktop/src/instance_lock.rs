//! Single-instance coordination over a loopback TCP endpoint.
//!
//! The first process binds the endpoint, writes a fresh random key into the
//! user's data directory and keeps both for its lifetime. A later launch
//! finds the address taken and forwards its argv to the primary.
//!
//! The port alone is visible to every local account, so both sides prove
//! knowledge of the key before argv crosses:
//!
//! 1. forwarder -> primary: `{"nonce": n1}`
//! 2. primary -> forwarder: `{"proof": H(key, primary, n1), "nonce": n2}`
//! 3. forwarder -> primary: `{"proof": H(key, forwarder, n2), "argv": [...]}`
//! 4. primary -> forwarder: `{"ok": bool}`
//!
//! A listener that cannot answer step 2 never sees the argv, and a client
//! that cannot answer step 3 never reaches the link coordinator.

use std::fs;
use std::io::Write;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use crate::link_context::Activation;

pub const DEFAULT_INSTANCE_ADDR: &str = "127.0.0.1:47821";
pub const DEFAULT_FORWARD_TIMEOUT_MS: u64 = 2_000;
pub const INSTANCE_KEY_FILE: &str = "instance.key";
const MAX_ACTIVATION_BYTES: u64 = 64 * 1024;
const ACTIVATION_READ_TIMEOUT: Duration = Duration::from_secs(2);
const ROLE_PRIMARY: &str = "primary";
const ROLE_FORWARDER: &str = "forwarder";

#[derive(Debug, Error)]
pub enum InstanceLockError {
    #[error("instance_lock_bind_failed:{addr}:{message}")]
    Bind { addr: SocketAddr, message: String },
    #[error("instance_key_unavailable:{path}:{message}")]
    KeyUnavailable { path: String, message: String },
    #[error("instance_forward_connect_failed:{message}")]
    Connect { message: String },
    #[error("instance_io_failed:{message}")]
    Io { message: String },
    #[error("instance_activation_decode_failed:{message}")]
    Decode { message: String },
    #[error("instance_peer_unverified")]
    Unverified,
    #[error("instance_forward_rejected")]
    Rejected,
    #[error("instance_forward_timed_out")]
    TimedOut,
}

#[derive(Debug)]
pub enum LockOutcome {
    Primary(InstanceLock),
    AlreadyRunning,
}

#[derive(Debug, Serialize, Deserialize)]
struct Hello {
    nonce: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct Challenge {
    proof: String,
    nonce: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct ActivationRequest {
    proof: String,
    argv: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ActivationReply {
    ok: bool,
}

/// Per-run secret shared through a file only the current user can read.
#[derive(Clone)]
struct InstanceKey([u8; 32]);

impl std::fmt::Debug for InstanceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("InstanceKey(..)")
    }
}

impl InstanceKey {
    fn generate() -> Self {
        Self(rand::random())
    }

    fn load(path: &Path) -> Result<Self, InstanceLockError> {
        let unavailable = |message: String| InstanceLockError::KeyUnavailable {
            path: path.display().to_string(),
            message,
        };
        let raw = fs::read_to_string(path).map_err(|error| unavailable(error.to_string()))?;
        let bytes = hex::decode(raw.trim()).map_err(|error| unavailable(error.to_string()))?;
        let key = <[u8; 32]>::try_from(bytes.as_slice())
            .map_err(|_| unavailable("expected 32 bytes".to_string()))?;
        Ok(Self(key))
    }

    fn save(&self, path: &Path) -> Result<(), InstanceLockError> {
        let unavailable = |error: std::io::Error| InstanceLockError::KeyUnavailable {
            path: path.display().to_string(),
            message: error.to_string(),
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(unavailable)?;
        }
        let mut options = fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
            options.mode(0o600);
            if path.exists() {
                fs::set_permissions(path, fs::Permissions::from_mode(0o600))
                    .map_err(unavailable)?;
            }
        }
        let mut file = options.open(path).map_err(unavailable)?;
        file.write_all(hex::encode(self.0).as_bytes())
            .map_err(unavailable)
    }

    fn prove(&self, role: &str, nonce: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.0);
        hasher.update(role.as_bytes());
        hasher.update(b"\n");
        hasher.update(nonce.as_bytes());
        hex::encode(hasher.finalize())
    }

    fn verify(&self, role: &str, nonce: &str, proof: &str) -> bool {
        let expected = self.prove(role, nonce);
        expected.len() == proof.len()
            && expected
                .bytes()
                .zip(proof.bytes())
                .fold(0_u8, |diff, (left, right)| diff | (left ^ right))
                == 0
    }
}

fn random_nonce() -> String {
    hex::encode(rand::random::<[u8; 16]>())
}

#[derive(Debug)]
pub struct InstanceLock {
    listener: TcpListener,
    key: InstanceKey,
}

impl InstanceLock {
    /// Binds `addr`. On success a fresh key is written to `key_path` for
    /// later launches to prove themselves with.
    pub async fn acquire(addr: SocketAddr, key_path: &Path) -> Result<LockOutcome, InstanceLockError> {
        match TcpListener::bind(addr).await {
            Ok(listener) => {
                let key = InstanceKey::generate();
                key.save(key_path)?;
                tracing::info!(addr = %addr, key_path = %key_path.display(), "instance lock acquired");
                Ok(LockOutcome::Primary(Self { listener, key }))
            }
            Err(error) if error.kind() == std::io::ErrorKind::AddrInUse => {
                tracing::info!(addr = %addr, "another instance holds the lock");
                Ok(LockOutcome::AlreadyRunning)
            }
            Err(error) => Err(InstanceLockError::Bind {
                addr,
                message: error.to_string(),
            }),
        }
    }

    #[cfg(test)]
    pub fn local_addr(&self) -> Result<SocketAddr, InstanceLockError> {
        self.listener.local_addr().map_err(io_error)
    }

    /// Accepts second-instance notifications until the activation receiver
    /// is dropped. Holding `self` keeps the lock.
    pub async fn serve(self, activations: mpsc::UnboundedSender<Activation>) {
        loop {
            let accepted = tokio::select! {
                accepted = self.listener.accept() => accepted,
                () = activations.closed() => break,
            };
            let (stream, peer) = match accepted {
                Ok(accepted) => accepted,
                Err(error) => {
                    tracing::warn!(error = %error, "instance lock accept failed");
                    continue;
                }
            };
            let activations = activations.clone();
            let key = self.key.clone();
            tokio::spawn(async move {
                if let Err(error) = handle_activation(stream, &key, &activations).await {
                    tracing::warn!(peer = %peer, error = %error, "second-instance activation dropped");
                }
            });
        }
        tracing::debug!("instance lock listener stopped");
    }
}

async fn handle_activation(
    stream: TcpStream,
    key: &InstanceKey,
    activations: &mpsc::UnboundedSender<Activation>,
) -> Result<(), InstanceLockError> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader.take(MAX_ACTIVATION_BYTES));

    let hello = match read_message::<_, Hello>(&mut reader).await {
        Ok(hello) => hello,
        Err(error) => {
            write_line(&mut writer, &ActivationReply { ok: false }).await?;
            return Err(error);
        }
    };
    let nonce = random_nonce();
    write_line(
        &mut writer,
        &Challenge {
            proof: key.prove(ROLE_PRIMARY, &hello.nonce),
            nonce: nonce.clone(),
        },
    )
    .await?;

    let request = read_message::<_, ActivationRequest>(&mut reader).await;
    let verified = request
        .as_ref()
        .is_ok_and(|request| key.verify(ROLE_FORWARDER, &nonce, &request.proof));
    let accepted = match &request {
        Ok(request) if verified => activations
            .send(Activation::SecondInstance {
                argv: request.argv.clone(),
            })
            .is_ok(),
        _ => false,
    };
    write_line(&mut writer, &ActivationReply { ok: accepted }).await?;

    request?;
    if verified {
        Ok(())
    } else {
        Err(InstanceLockError::Unverified)
    }
}

/// Hands `argv` to the running instance and waits for its acknowledgement.
/// Nothing is sent unless the listener proves it holds the key at
/// `key_path`.
pub async fn forward_activation(
    addr: SocketAddr,
    key_path: &Path,
    argv: &[String],
    timeout: Duration,
) -> Result<(), InstanceLockError> {
    let key = InstanceKey::load(key_path)?;
    tokio::time::timeout(timeout, forward_activation_inner(addr, &key, argv))
        .await
        .map_err(|_| InstanceLockError::TimedOut)?
}

async fn forward_activation_inner(
    addr: SocketAddr,
    key: &InstanceKey,
    argv: &[String],
) -> Result<(), InstanceLockError> {
    let stream = TcpStream::connect(addr)
        .await
        .map_err(|error| InstanceLockError::Connect {
            message: error.to_string(),
        })?;
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader.take(MAX_ACTIVATION_BYTES));

    let nonce = random_nonce();
    write_line(&mut writer, &Hello { nonce: nonce.clone() }).await?;
    let challenge = read_message::<_, Challenge>(&mut reader).await?;
    if !key.verify(ROLE_PRIMARY, &nonce, &challenge.proof) {
        tracing::warn!(addr = %addr, "instance lock held by an unverified listener");
        return Err(InstanceLockError::Unverified);
    }

    write_line(
        &mut writer,
        &ActivationRequest {
            proof: key.prove(ROLE_FORWARDER, &challenge.nonce),
            argv: argv.to_vec(),
        },
    )
    .await?;
    let reply = read_message::<_, ActivationReply>(&mut reader).await?;
    if reply.ok {
        Ok(())
    } else {
        Err(InstanceLockError::Rejected)
    }
}

/// Default key location, next to the store.
pub fn default_key_path(data_dir: &Path) -> PathBuf {
    data_dir.join(INSTANCE_KEY_FILE)
}

async fn read_message<R, T>(reader: &mut R) -> Result<T, InstanceLockError>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    let mut line = String::new();
    tokio::time::timeout(ACTIVATION_READ_TIMEOUT, reader.read_line(&mut line))
        .await
        .map_err(|_| InstanceLockError::TimedOut)?
        .map_err(io_error)?;
    serde_json::from_str(line.trim()).map_err(|error| InstanceLockError::Decode {
        message: error.to_string(),
    })
}

async fn write_line<W, T>(writer: &mut W, value: &T) -> Result<(), InstanceLockError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut encoded = serde_json::to_vec(value).map_err(|error| InstanceLockError::Decode {
        message: error.to_string(),
    })?;
    encoded.push(b'\n');
    writer.write_all(&encoded).await.map_err(io_error)?;
    writer.flush().await.map_err(io_error)
}

fn io_error(error: std::io::Error) -> InstanceLockError {
    InstanceLockError::Io {
        message: error.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link_context::{LinkContext, LinkContextConfig};
    use crate::relay::{RelayMessage, relay_channel};
    use crate::surface::{HeadlessSurface, SurfaceEvent};
    use tokio::sync::oneshot;

    const LINK: &str = "cloak://auth?data=%7B%22user%22%3A%7B%22linkedAccountId%22%3A42%7D%7D";

    async fn primary_on_ephemeral_port(key_path: &Path) -> (InstanceLock, SocketAddr) {
        let addr: SocketAddr = "127.0.0.1:0".parse().expect("loopback addr");
        let lock = match InstanceLock::acquire(addr, key_path).await.expect("acquire") {
            LockOutcome::Primary(lock) => Some(lock),
            LockOutcome::AlreadyRunning => None,
        }
        .expect("ephemeral port is always free");
        let bound = lock.local_addr().expect("bound addr");
        (lock, bound)
    }

    async fn read_reply<T: DeserializeOwned>(reader: &mut BufReader<TcpStream>) -> T {
        let mut line = String::new();
        reader.read_line(&mut line).await.expect("reply line");
        serde_json::from_str(line.trim()).expect("reply json")
    }

    #[tokio::test]
    async fn second_acquire_reports_already_running() {
        let temp = tempfile::tempdir().expect("temp dir");
        let key_path = temp.path().join(INSTANCE_KEY_FILE);
        let (_lock, addr) = primary_on_ephemeral_port(&key_path).await;
        let outcome = InstanceLock::acquire(addr, &key_path)
            .await
            .expect("second acquire");
        assert!(matches!(outcome, LockOutcome::AlreadyRunning));
    }

    #[tokio::test]
    async fn forwarded_argv_reaches_primary() {
        let temp = tempfile::tempdir().expect("temp dir");
        let key_path = temp.path().join(INSTANCE_KEY_FILE);
        let (lock, addr) = primary_on_ephemeral_port(&key_path).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let server = tokio::spawn(lock.serve(tx));

        let argv = vec!["cloak-desktop".to_string(), LINK.to_string()];
        forward_activation(addr, &key_path, &argv, Duration::from_secs(2))
            .await
            .expect("forward");

        let activation = rx.recv().await.expect("activation");
        assert_eq!(activation, Activation::SecondInstance { argv });

        drop(rx);
        server.await.expect("serve loop exits once receiver is gone");
    }

    #[tokio::test]
    async fn listener_without_the_key_never_sees_argv() {
        let temp = tempfile::tempdir().expect("temp dir");
        let own_key = temp.path().join("own").join(INSTANCE_KEY_FILE);
        let other_key = temp.path().join("other").join(INSTANCE_KEY_FILE);
        InstanceKey::generate().save(&own_key).expect("own key");
        let (lock, addr) = primary_on_ephemeral_port(&other_key).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        tokio::spawn(lock.serve(tx));

        let error = forward_activation(addr, &own_key, &[LINK.to_string()], Duration::from_secs(2))
            .await
            .expect_err("foreign listener");
        assert!(matches!(error, InstanceLockError::Unverified));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn client_without_the_key_cannot_inject_links() {
        let temp = tempfile::tempdir().expect("temp dir");
        let (lock, addr) = primary_on_ephemeral_port(&temp.path().join(INSTANCE_KEY_FILE)).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        tokio::spawn(lock.serve(tx));

        let mut stream = BufReader::new(TcpStream::connect(addr).await.expect("connect"));
        stream
            .get_mut()
            .write_all(b"{\"nonce\":\"00\"}\n")
            .await
            .expect("hello");
        let challenge: Challenge = read_reply(&mut stream).await;
        assert!(!challenge.nonce.is_empty());

        let forged = ActivationRequest {
            proof: "0".repeat(64),
            argv: vec![LINK.to_string()],
        };
        let mut encoded = serde_json::to_vec(&forged).expect("encode");
        encoded.push(b'\n');
        stream.get_mut().write_all(&encoded).await.expect("request");
        let reply: ActivationReply = read_reply(&mut stream).await;

        assert!(!reply.ok);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn malformed_activation_is_rejected() {
        let temp = tempfile::tempdir().expect("temp dir");
        let (lock, addr) = primary_on_ephemeral_port(&temp.path().join(INSTANCE_KEY_FILE)).await;
        let (tx, _rx) = mpsc::unbounded_channel();
        tokio::spawn(lock.serve(tx));

        let mut stream = TcpStream::connect(addr).await.expect("connect");
        stream.write_all(b"not json\n").await.expect("write");
        let mut reply = String::new();
        BufReader::new(stream)
            .read_line(&mut reply)
            .await
            .expect("reply");
        assert_eq!(reply.trim(), r#"{"ok":false}"#);
    }

    #[tokio::test]
    async fn forward_without_primary_fails_to_connect() {
        let temp = tempfile::tempdir().expect("temp dir");
        let key_path = temp.path().join(INSTANCE_KEY_FILE);
        let (lock, addr) = primary_on_ephemeral_port(&key_path).await;
        drop(lock);
        let error = forward_activation(addr, &key_path, &[], Duration::from_secs(2))
            .await
            .expect_err("nobody listening");
        assert!(matches!(error, InstanceLockError::Connect { .. }));
    }

    #[tokio::test]
    async fn forward_without_key_file_sends_nothing() {
        let temp = tempfile::tempdir().expect("temp dir");
        let addr: SocketAddr = "127.0.0.1:9".parse().expect("addr");
        let error = forward_activation(
            addr,
            &temp.path().join(INSTANCE_KEY_FILE),
            &[],
            Duration::from_secs(2),
        )
        .await
        .expect_err("missing key");
        assert!(matches!(error, InstanceLockError::KeyUnavailable { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn key_file_is_private_to_the_user() {
        use std::os::unix::fs::PermissionsExt;

        let temp = tempfile::tempdir().expect("temp dir");
        let key_path = temp.path().join(INSTANCE_KEY_FILE);
        let (_lock, _addr) = primary_on_ephemeral_port(&key_path).await;
        let mode = fs::metadata(&key_path).expect("key metadata").permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn forwarded_link_focuses_primary_and_reaches_listener() {
        let temp = tempfile::tempdir().expect("temp dir");
        let key_path = temp.path().join(INSTANCE_KEY_FILE);
        let (lock, addr) = primary_on_ephemeral_port(&key_path).await;

        let (sender, mut endpoint, signals) = relay_channel(Duration::from_secs(2));
        let context = LinkContext::new(
            LinkContextConfig {
                scheme: "cloak".to_string(),
                ready_timeout: Duration::from_secs(3),
            },
            sender,
            HeadlessSurface::minimized(),
        );
        let (activation_tx, activation_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let server = tokio::spawn(lock.serve(activation_tx));
        let coordinator = tokio::spawn(context.run(activation_rx, signals, shutdown_rx));
        endpoint.signal_ready();

        forward_activation(
            addr,
            &key_path,
            &["cloak-desktop".to_string(), LINK.to_string()],
            Duration::from_secs(2),
        )
        .await
        .expect("forward");

        let message = endpoint.recv().await.expect("relayed link");
        let RelayMessage::DeepLinkAuth { raw_data, .. } = &message;
        assert_eq!(raw_data, "%7B%22user%22%3A%7B%22linkedAccountId%22%3A42%7D%7D");
        endpoint.acknowledge(message.delivery_id());

        shutdown_tx.send(()).expect("shutdown");
        let context = coordinator.await.expect("coordinator");
        assert_eq!(
            context.surface().events(),
            &[SurfaceEvent::Restored, SurfaceEvent::Focused]
        );
        assert!(context.take_pending().is_none());
        assert!(endpoint.try_recv().is_none());
        drop(context);
        server.await.expect("serve loop exits once the coordinator is gone");
    }
}
