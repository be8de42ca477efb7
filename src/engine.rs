//! The connection actor and its cloneable handle.
//!
//! One spawned task owns the framer, correlator, router, background-job
//! table and the socket's write half. Callers never touch the socket
//! directly; they send an [`ActorMessage`] over an `mpsc` channel and
//! `.await` the `oneshot` it was handed back, the same shape hyper's
//! `client::dispatch` uses to turn a shared connection into a cloneable
//! request/response handle.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use futures_util::sink::SinkExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, error, trace};
use uuid::Uuid;

use crate::correlator::{Correlator, Reply};
use crate::error::{Error, Result};
use crate::framer::Framer;
use crate::message::{HeaderMap, Message};
use crate::router::{EventRouter, SubscribedEvents, SubscriptionId};

/// A callback invoked for every event matching a subscription.
pub type EventCallback = Arc<dyn Fn(&Message) + Send + Sync>;

/// A callback invoked once, when the connection ends, with the reason.
pub type DisconnectCallback = Arc<dyn Fn(&Error) + Send + Sync>;

pub(crate) enum ActorMessage {
    /// Write a pre-serialized frame; resolve the reply with the head of
    /// the command FIFO.
    SendCommand { frame: Bytes, reply: oneshot::Sender<Reply> },
    /// Write a pre-serialized frame; resolve the reply with the head of
    /// the API FIFO.
    SendApi { frame: Bytes, reply: oneshot::Sender<Reply> },
    /// Write a `bgapi` frame carrying `job_uuid`; resolve the reply when
    /// the matching `BACKGROUND_JOB` event arrives.
    SendBgapi { frame: Bytes, job_uuid: String, reply: oneshot::Sender<Reply> },
    /// Write a `myevents` frame; marks the `SubscribedEvents` set so that
    /// subsequent `register_event(subscribe = true)` calls no longer emit
    /// a redundant `event plain` (see `SubscribedEvents::covers`).
    Myevents { frame: Bytes, reply: oneshot::Sender<Reply> },
    /// Register an event subscription; the registration itself does not
    /// await a reply (see `EventRouter::register`'s contract).
    RegisterEvent {
        event_name: String,
        subscribe: bool,
        callback: EventCallback,
        reply: oneshot::Sender<SubscriptionId>,
    },
    DeregisterEvent { id: SubscriptionId },
    /// Register the callback invoked once the connection ends (replaces
    /// any previously registered one).
    OnDisconnect { callback: DisconnectCallback },
    /// Write the outbound `connect\n\n` frame. Unlike every other write,
    /// this expects no `command/reply`: the answering frame is the
    /// channel-info frame, diverted before normal content-type routing
    /// (see `Mode::Outbound`).
    Connect,
}

/// Which connection mode this actor is driving. Outbound connections
/// deliver their first frame as channel info rather than through normal
/// `Content-Type` routing.
pub(crate) enum Mode {
    Inbound,
    Outbound { channel_info: Option<oneshot::Sender<Message>> },
}

/// A cloneable handle onto a connection's actor task.
///
/// Cloning an `Engine` is cheap (it's a channel sender); every clone
/// talks to the same underlying connection.
#[derive(Clone)]
pub struct Engine {
    tx: mpsc::UnboundedSender<ActorMessage>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine").finish_non_exhaustive()
    }
}

impl Engine {
    pub(crate) fn new(tx: mpsc::UnboundedSender<ActorMessage>) -> Engine {
        Engine { tx }
    }

    fn send(&self, msg: ActorMessage) -> Result<()> {
        self.tx.send(msg).map_err(|_| Error::connection_lost())
    }

    /// Send a raw command line (e.g. `auth <password>`), expecting a
    /// `command/reply`.
    pub async fn send_line(&self, line: impl Into<String>) -> Result<Message> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let frame = format!("{}\n\n", line.into()).into_bytes();
        self.send(ActorMessage::SendCommand { frame: Bytes::from(frame), reply: reply_tx })?;
        await_reply(reply_rx).await
    }

    /// Send `api <cmd>`, expecting an `api/response`.
    pub async fn send_api(&self, cmd: impl Into<String>) -> Result<Message> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let frame = format!("api {}\n\n", cmd.into()).into_bytes();
        self.send(ActorMessage::SendApi { frame: Bytes::from(frame), reply: reply_tx })?;
        await_reply(reply_rx).await
    }

    /// Send `bgapi <cmd>`, resolving once the matching `BACKGROUND_JOB`
    /// event arrives (the immediate `command/reply` is informational and
    /// is not what completes this future).
    pub async fn send_bgapi(&self, cmd: impl Into<String>) -> Result<Message> {
        let job_uuid = Uuid::new_v4().to_string();
        let (reply_tx, reply_rx) = oneshot::channel();
        let frame = format!("bgapi {}\nJob-UUID: {}\n\n", cmd.into(), job_uuid).into_bytes();
        self.send(ActorMessage::SendBgapi { frame: Bytes::from(frame), job_uuid, reply: reply_tx })?;
        await_reply(reply_rx).await
    }

    /// Execute a dialplan application via a `SendMsg` frame, expecting a
    /// `command/reply`. `uuid` addresses a specific call leg on an
    /// inbound connection; outbound connections omit it (bound to the
    /// channel that dialed in).
    pub async fn send_command(
        &self,
        app: &str,
        args: Option<&str>,
        uuid: Option<&str>,
        lock: bool,
    ) -> Result<Message> {
        let mut headers = HeaderMap::new();
        headers.insert("call-command", "execute");
        headers.insert("execute-app-name", app);
        if let Some(args) = args {
            headers.insert("execute-app-arg", args);
        }
        if lock {
            headers.insert("event-lock", "true");
        }
        let sendmsg_line = match uuid {
            Some(uuid) => format!("sendmsg {}\n", uuid),
            None => "sendmsg\n".to_string(),
        };
        let mut frame = sendmsg_line.into_bytes();
        frame.extend_from_slice(&Message::new(headers, Bytes::new()).serialize());

        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(ActorMessage::SendCommand { frame: Bytes::from(frame), reply: reply_tx })?;
        await_reply(reply_rx).await
    }

    /// Subscribe to one or more space-separated event names (e.g. `"all"`
    /// or `"CHANNEL_ANSWER CHANNEL_HANGUP"`).
    pub async fn subscribe_events(&self, names: &str) -> Result<Message> {
        self.send_line(format!("event plain {}", names)).await
    }

    /// Restrict delivered events to those pertaining to one call leg.
    ///
    /// Once this succeeds, every event on the bound channel is considered
    /// subscribed (the `myevents` sentinel in `SubscribedEvents`), so later
    /// `register_event(subscribe = true)` calls no longer emit a redundant
    /// `event plain`.
    pub async fn myevents(&self, uuid: Option<&str>) -> Result<Message> {
        let line = match uuid {
            Some(uuid) => format!("myevents {}\n\n", uuid),
            None => "myevents\n\n".to_string(),
        };
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(ActorMessage::Myevents { frame: Bytes::from(line.into_bytes()), reply: reply_tx })?;
        await_reply(reply_rx).await
    }

    /// Register a callback for `event_name`, optionally subscribing to it
    /// first (see `EventRouter::register`'s suppression rule).
    pub async fn register_event(
        &self,
        event_name: impl Into<String>,
        subscribe: bool,
        callback: EventCallback,
    ) -> Result<SubscriptionId> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(ActorMessage::RegisterEvent {
            event_name: event_name.into(),
            subscribe,
            callback,
            reply: reply_tx,
        })?;
        reply_rx.await.map_err(|_| Error::connection_lost())
    }

    /// Remove a previously registered subscription.
    pub fn deregister_event(&self, id: SubscriptionId) -> Result<()> {
        self.send(ActorMessage::DeregisterEvent { id })
    }

    /// Register a callback invoked exactly once, when the connection
    /// ends, with the reason it ended (a disconnect notice from
    /// FreeSWITCH, an I/O error, or the peer closing the socket all
    /// surface here as a `ConnectionLost`-family `Error`). Registering a
    /// new callback replaces any previous one.
    pub fn on_disconnect(&self, callback: DisconnectCallback) -> Result<()> {
        self.send(ActorMessage::OnDisconnect { callback })
    }

    /// Write the outbound `connect\n\n` frame (see `ActorMessage::Connect`).
    pub(crate) fn send_connect(&self) -> Result<()> {
        self.send(ActorMessage::Connect)
    }
}

async fn await_reply(rx: oneshot::Receiver<Reply>) -> Result<Message> {
    rx.await.map_err(|_| Error::connection_lost())?
}

/// Drive one connection: read frames, dispatch them, and service outbound
/// write requests, until the socket closes or every handle is dropped.
///
/// `leftover` is any bytes already read off the socket by a handshake
/// that ran before the actor started (e.g. inbound's `auth/request`
/// wait reading ahead of its own frame boundary); it is seeded into the
/// framer's buffer so nothing is lost.
pub(crate) async fn run<IO>(io: IO, mut mode: Mode, mut rx: mpsc::UnboundedReceiver<ActorMessage>, leftover: Vec<u8>)
where
    IO: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(io);
    let mut reader = FramedRead::new(read_half, Framer::new());
    reader.read_buffer_mut().extend_from_slice(&leftover);
    let mut writer = FramedWrite::new(write_half, RawFrameEncoder);

    let mut correlator = Correlator::new();
    let mut router = EventRouter::new();
    let mut subscribed = SubscribedEvents::default();
    let mut disconnect_hook: Option<DisconnectCallback> = None;

    let reason = loop {
        tokio::select! {
            frame = futures_util::StreamExt::next(&mut reader) => {
                match frame {
                    Some(Ok(message)) => {
                        trace!(?message, "decoded frame");
                        if let Err(err) = handle_frame(message, &mut mode, &mut correlator, &mut router).await {
                            error!(%err, "error handling frame");
                        }
                    }
                    Some(Err(err)) => {
                        error!(%err, "framer error, closing connection");
                        break err;
                    }
                    None => {
                        debug!("connection closed by peer");
                        break Error::connection_lost();
                    }
                }
            }
            outgoing = rx.recv() => {
                match outgoing {
                    Some(msg) => {
                        if let Err(err) = handle_outgoing(msg, &mut writer, &mut correlator, &mut router, &mut subscribed, &mut disconnect_hook).await {
                            error!(%err, "error writing frame, closing connection");
                            break err;
                        }
                    }
                    None => {
                        debug!("all engine handles dropped, closing connection");
                        break Error::connection_lost();
                    }
                }
            }
        }
    };

    correlator.fail_all();
    if let Some(hook) = disconnect_hook {
        hook(&reason);
    }
}

/// `tokio_util::codec::Encoder` adapter for already-serialized frames
/// (every outgoing write is built as a complete `Bytes` buffer before it
/// reaches the actor, so this encoder just copies it through).
struct RawFrameEncoder;

impl tokio_util::codec::Encoder<Bytes> for RawFrameEncoder {
    type Error = Error;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<()> {
        dst.extend_from_slice(&item);
        Ok(())
    }
}

async fn handle_outgoing<W>(
    msg: ActorMessage,
    writer: &mut FramedWrite<W, RawFrameEncoder>,
    correlator: &mut Correlator,
    router: &mut EventRouter,
    subscribed: &mut SubscribedEvents,
    disconnect_hook: &mut Option<DisconnectCallback>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    match msg {
        ActorMessage::SendCommand { frame, reply } => {
            correlator.expect_command_reply(reply);
            writer.send(frame).await?;
        }
        ActorMessage::SendApi { frame, reply } => {
            correlator.expect_api_reply(reply);
            writer.send(frame).await?;
        }
        ActorMessage::SendBgapi { frame, job_uuid, reply } => {
            // No command-FIFO entry is pushed for a bgapi send: its
            // informational command/reply must never pop an unrelated
            // pending command (see correlator::Correlator::expect_background_job).
            correlator.expect_background_job(job_uuid, reply);
            writer.send(frame).await?;
        }
        ActorMessage::Myevents { frame, reply } => {
            correlator.expect_command_reply(reply);
            writer.send(frame).await?;
            subscribed.mark_myevents();
        }
        ActorMessage::RegisterEvent { event_name, subscribe, callback, reply } => {
            if subscribe && !subscribed.covers(&event_name) {
                // FreeSWITCH answers `event plain ...` with a real
                // command/reply like any other command; it must occupy a
                // slot in the command FIFO or the next unrelated
                // command/reply gets popped in its place (see Myevents
                // above for the same requirement). Nobody awaits this
                // particular ack, so the receiver is dropped immediately.
                let (ack_tx, _ack_rx) = oneshot::channel();
                correlator.expect_command_reply(ack_tx);
                let subscribe_frame = format!("event plain {}\n\n", event_name).into_bytes();
                writer.send(Bytes::from(subscribe_frame)).await?;
                mark_subscribed(subscribed, &event_name);
            }
            let id = router.register(&event_name, callback);
            let _ = reply.send(id);
        }
        ActorMessage::DeregisterEvent { id } => {
            router.deregister(id);
        }
        ActorMessage::OnDisconnect { callback } => {
            *disconnect_hook = Some(callback);
        }
        ActorMessage::Connect => {
            writer.send(Bytes::from_static(b"connect\n\n")).await?;
        }
    }
    Ok(())
}

fn mark_subscribed(subscribed: &mut SubscribedEvents, event_name: &str) {
    match event_name {
        "all" => subscribed.mark_all(),
        _ => subscribed.mark(event_name),
    }
}

async fn handle_frame(
    mut message: Message,
    mode: &mut Mode,
    correlator: &mut Correlator,
    router: &mut EventRouter,
) -> Result<()> {
    if let Mode::Outbound { channel_info } = mode {
        if let Some(tx) = channel_info.take() {
            message.decode_url_values();
            let _ = tx.send(message);
            return Ok(());
        }
    }

    let content_type = message.content_type().unwrap_or_default().to_string();
    match content_type.as_str() {
        "api/response" => {
            correlator.resolve_api_reply(Ok(message));
        }
        "command/reply" => {
            let reply_text = message.header("Reply-Text").unwrap_or_default().to_string();
            let is_ok = reply_text.starts_with("+OK");
            let has_job_uuid = message.header("Job-UUID").is_some();
            if !has_job_uuid {
                if is_ok {
                    correlator.resolve_command_reply(Ok(message));
                } else {
                    correlator.resolve_command_reply(Err(Error::command(reply_text)));
                }
            }
        }
        "text/event-plain" => {
            let mut event = Message::parse_complete(&message.body)?;
            let event_name = event.header("Event-Name").unwrap_or_default().to_string();
            if event_name == "CUSTOM" {
                event.decode_url_values();
            }
            if event_name == "BACKGROUND_JOB" {
                if let Some(job_uuid) = event.header("Job-UUID").map(|s| s.to_string()) {
                    correlator.resolve_background_job(&job_uuid, Ok(event.clone()));
                } else {
                    error!("BACKGROUND_JOB event missing Job-UUID header");
                }
            }
            router.dispatch(&event);
        }
        "text/disconnect-notice" => {
            debug!("received disconnect notice");
        }
        "auth/request" => {
            // Consumed directly by `inbound::connect`'s handshake before
            // the actor loop starts; seeing it here means it arrived
            // again unexpectedly.
            error!("unexpected auth/request after handshake");
        }
        other => {
            error!(content_type = other, "unrecognized frame, discarding");
        }
    }
    Ok(())
}
