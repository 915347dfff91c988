//! Control protocol between the host and the in-sandbox bootstrap
//!
//! Each message is a single datagram: a magic word, a body length, an 8-byte
//! NUL-padded command name, and a body of `key NUL value NUL` pairs. The
//! same framing runs in both directions. On top of the codec sits a small
//! state machine that drives the worker through its lifecycle:
//! start -> running -> done, then invoke -> done/error/fault per request.

use crate::errors::ControlError;
use std::collections::HashMap;
use tokio::net::UnixDatagram;

pub const MAGIC: u32 = 0x47697244;

const HEADER_LEN: usize = 16;
const MAX_DATAGRAM: usize = 4096;

const CMD_START: &str = "START";
const CMD_RUNNING: &str = "RUNNING";
const CMD_DONE: &str = "DONE";
const CMD_FAULT: &str = "FAULT";
const CMD_INVOKE: &str = "INVOKE";
const CMD_ERROR: &str = "ERROR";

/// Lifecycle state of the bootstrap on the far end of the channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlState {
    Starting,
    Initializing,
    Ready,
    Processing,
    Error,
    Fault,
}

pub type Args = HashMap<String, String>;

/// Frame a command and its argument map into one datagram
pub fn encode(cmd: &str, args: &Args) -> Vec<u8> {
    let mut body = Vec::new();
    for (key, value) in args {
        body.extend_from_slice(key.as_bytes());
        body.push(0);
        body.extend_from_slice(value.as_bytes());
        body.push(0);
    }
    let mut msg = vec![0u8; HEADER_LEN + body.len()];
    msg[0..4].copy_from_slice(&MAGIC.to_be_bytes());
    msg[4..8].copy_from_slice(&(body.len() as u32).to_be_bytes());
    let cmd = cmd.as_bytes();
    let n = cmd.len().min(8);
    msg[8..8 + n].copy_from_slice(&cmd[..n]);
    msg[HEADER_LEN..].copy_from_slice(&body);
    msg
}

/// Parse one datagram into its command and argument map
pub fn decode(msg: &[u8]) -> Result<(String, Args), ControlError> {
    if msg.len() < HEADER_LEN || msg[0..4] != MAGIC.to_be_bytes() {
        return Err(ControlError::InvalidMagic);
    }
    let name = &msg[8..16];
    let end = name.iter().position(|b| *b == 0).unwrap_or(8);
    let cmd = String::from_utf8_lossy(&name[..end]).into_owned();

    let size = u32::from_be_bytes([msg[4], msg[5], msg[6], msg[7]]) as usize;
    let mut args = Args::new();
    if size > 0 {
        let body = msg
            .get(HEADER_LEN..HEADER_LEN + size)
            .ok_or(ControlError::KvParserFailed)?;
        let mut tokens: Vec<&[u8]> = body.split(|b| *b == 0).collect();
        tokens.pop();
        if tokens.len() % 2 != 0 {
            return Err(ControlError::KvParserFailed);
        }
        for pair in tokens.chunks(2) {
            args.insert(
                String::from_utf8_lossy(pair[0]).into_owned(),
                String::from_utf8_lossy(pair[1]).into_owned(),
            );
        }
    }
    Ok((cmd, args))
}

/// Host side of the connected datagram pair
pub struct ControlChannel {
    socket: UnixDatagram,
    state: ControlState,
}

impl ControlChannel {
    pub fn new(socket: UnixDatagram) -> ControlChannel {
        ControlChannel {
            socket,
            state: ControlState::Starting,
        }
    }

    pub fn state(&self) -> ControlState {
        self.state
    }

    async fn send(&self, cmd: &str, args: &Args) -> Result<(), ControlError> {
        self.socket.send(&encode(cmd, args)).await?;
        Ok(())
    }

    async fn receive(&self) -> Result<(String, Args), ControlError> {
        let mut buf = [0u8; MAX_DATAGRAM];
        let n = self.socket.recv(&mut buf).await?;
        decode(&buf[..n])
    }

    /// Initial handshake: send START, then wait for the bootstrap to report
    /// RUNNING and finally DONE. RUNNING and DONE received in other states
    /// are ignored and the read loop continues.
    pub async fn init(&mut self, args: &Args) -> Result<(), ControlError> {
        self.send(CMD_START, args).await?;

        self.state = ControlState::Starting;
        loop {
            let (cmd, _) = self.receive().await?;
            match cmd.as_str() {
                CMD_RUNNING => {
                    if self.state == ControlState::Starting {
                        self.state = ControlState::Initializing;
                    }
                }
                CMD_DONE => {
                    if self.state == ControlState::Initializing {
                        self.state = ControlState::Ready;
                        return Ok(());
                    }
                }
                CMD_FAULT => return Err(ControlError::ControlFault),
                _ => {
                    log::warn!("unknown command {:?} in state {:?}", cmd, self.state);
                    return Err(ControlError::UnknownCommand(cmd));
                }
            }
        }
    }

    /// One invocation round-trip. ERROR and FAULT are successful outcomes at
    /// this layer: the bootstrap has written its error document into the
    /// shared region, but the channel is left in a terminal state that
    /// prevents reuse.
    pub async fn invoke(&mut self, args: &Args) -> Result<(), ControlError> {
        if self.state != ControlState::Ready {
            return Err(ControlError::HandlerBusy);
        }

        self.send(CMD_INVOKE, args).await?;

        self.state = ControlState::Processing;
        loop {
            let (cmd, args) = self.receive().await?;
            match cmd.as_str() {
                CMD_DONE => {
                    if self.state == ControlState::Processing {
                        self.state = ControlState::Ready;
                        return Ok(());
                    }
                }
                CMD_ERROR => {
                    log::error!("handler error: {:?}", args);
                    self.state = ControlState::Error;
                    return Ok(());
                }
                CMD_FAULT => {
                    log::error!("runtime fault: {:?}", args);
                    self.state = ControlState::Fault;
                    return Ok(());
                }
                _ => {
                    log::warn!("unknown command {:?} in state {:?}", cmd, self.state);
                    return Err(ControlError::UnknownCommand(cmd));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(pairs: &[(&str, &str)]) -> Args {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn pair() -> (ControlChannel, UnixDatagram) {
        let (host, bootstrap) = UnixDatagram::pair().unwrap();
        (ControlChannel::new(host), bootstrap)
    }

    async fn reply(bootstrap: &UnixDatagram, cmd: &str, args: &Args) {
        bootstrap.send(&encode(cmd, args)).await.unwrap();
    }

    #[test]
    fn round_trip() {
        let sent = args(&[
            ("invokeid", "00000000-0000-1000-8000-000000000000"),
            ("handler", "handler.my_handler"),
            ("mode", "event"),
            ("supressinit", "0"),
        ]);
        let frame = encode("START", &sent);
        assert_eq!(&frame[0..4], &[0x47, 0x69, 0x72, 0x44]);
        let (cmd, decoded) = decode(&frame).unwrap();
        assert_eq!(cmd, "START");
        assert_eq!(decoded, sent);
    }

    #[test]
    fn round_trip_empty_args() {
        let frame = encode("RUNNING", &Args::new());
        assert_eq!(frame.len(), HEADER_LEN);
        let (cmd, decoded) = decode(&frame).unwrap();
        assert_eq!(cmd, "RUNNING");
        assert!(decoded.is_empty());
    }

    #[test]
    fn round_trip_max_body() {
        // 4080 bytes of body fills the datagram exactly
        let value = "v".repeat(4080 - "key".len() - 2);
        let sent = args(&[("key", &value)]);
        let frame = encode("INVOKE", &sent);
        assert_eq!(frame.len(), MAX_DATAGRAM);
        let (cmd, decoded) = decode(&frame).unwrap();
        assert_eq!(cmd, "INVOKE");
        assert_eq!(decoded, sent);
    }

    #[test]
    fn bad_magic() {
        let mut frame = encode("DONE", &Args::new());
        frame[0] = 0xff;
        assert!(matches!(decode(&frame), Err(ControlError::InvalidMagic)));
        assert!(matches!(decode(b"Gir"), Err(ControlError::InvalidMagic)));
    }

    #[test]
    fn odd_token_count() {
        let mut frame = encode("DONE", &Args::new());
        frame.extend_from_slice(b"orphan\0");
        frame[4..8].copy_from_slice(&7u32.to_be_bytes());
        assert!(matches!(decode(&frame), Err(ControlError::KvParserFailed)));
    }

    #[test]
    fn truncated_body() {
        let mut frame = encode("DONE", &Args::new());
        frame[4..8].copy_from_slice(&64u32.to_be_bytes());
        assert!(matches!(decode(&frame), Err(ControlError::KvParserFailed)));
    }

    #[tokio::test]
    async fn handshake_reaches_ready() {
        let (mut channel, bootstrap) = pair();
        reply(&bootstrap, "RUNNING", &Args::new()).await;
        reply(&bootstrap, "DONE", &Args::new()).await;
        channel.init(&Args::new()).await.unwrap();
        assert_eq!(channel.state(), ControlState::Ready);

        let (cmd, sent) = decode(&{
            let mut buf = [0u8; MAX_DATAGRAM];
            let n = bootstrap.recv(&mut buf).await.unwrap();
            buf[..n].to_vec()
        })
        .unwrap();
        assert_eq!(cmd, "START");
        assert!(sent.is_empty());
    }

    #[tokio::test]
    async fn handshake_ignores_done_before_running() {
        let (mut channel, bootstrap) = pair();
        reply(&bootstrap, "DONE", &Args::new()).await;
        reply(&bootstrap, "RUNNING", &Args::new()).await;
        reply(&bootstrap, "DONE", &Args::new()).await;
        channel.init(&Args::new()).await.unwrap();
        assert_eq!(channel.state(), ControlState::Ready);
    }

    #[tokio::test]
    async fn handshake_fault() {
        let (mut channel, bootstrap) = pair();
        reply(&bootstrap, "FAULT", &Args::new()).await;
        assert!(matches!(
            channel.init(&Args::new()).await,
            Err(ControlError::ControlFault)
        ));
    }

    #[tokio::test]
    async fn invoke_done_returns_to_ready() {
        let (mut channel, bootstrap) = pair();
        channel.state = ControlState::Ready;
        reply(&bootstrap, "DONE", &Args::new()).await;
        channel.invoke(&Args::new()).await.unwrap();
        assert_eq!(channel.state(), ControlState::Ready);
    }

    #[tokio::test]
    async fn invoke_error_poisons_channel() {
        let (mut channel, bootstrap) = pair();
        channel.state = ControlState::Ready;
        reply(&bootstrap, "ERROR", &args(&[("errortype", "unhandled")])).await;
        channel.invoke(&Args::new()).await.unwrap();
        assert_eq!(channel.state(), ControlState::Error);

        // a poisoned channel refuses further invokes
        assert!(matches!(
            channel.invoke(&Args::new()).await,
            Err(ControlError::HandlerBusy)
        ));
    }

    #[tokio::test]
    async fn invoke_fault_poisons_channel() {
        let (mut channel, bootstrap) = pair();
        channel.state = ControlState::Ready;
        reply(&bootstrap, "FAULT", &Args::new()).await;
        channel.invoke(&Args::new()).await.unwrap();
        assert_eq!(channel.state(), ControlState::Fault);
    }

    #[tokio::test]
    async fn unknown_command_is_an_error() {
        let (mut channel, bootstrap) = pair();
        channel.state = ControlState::Ready;
        reply(&bootstrap, "PING", &Args::new()).await;
        assert!(matches!(
            channel.invoke(&Args::new()).await,
            Err(ControlError::UnknownCommand(cmd)) if cmd == "PING"
        ));
    }

    #[tokio::test]
    async fn bad_frame_leaves_state_untouched() {
        let (mut channel, bootstrap) = pair();
        bootstrap.send(b"notmagic........").await.unwrap();
        assert!(matches!(
            channel.init(&Args::new()).await,
            Err(ControlError::InvalidMagic)
        ));
        assert_eq!(channel.state(), ControlState::Starting);
    }
}
