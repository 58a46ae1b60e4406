//-
// Copyright (c) 2026, Postern Developers
//
// This file is part of Postern.
//
// Postern is free software: you can  redistribute it and/or modify it under
// the terms of  the GNU General Public  License as published  by the Free
// Software Foundation, either version 3  of the License, or (at your option)
// any later version.
//
// Postern is distributed  in the hope that  it will be useful,  but WITHOUT
// ANY WARRANTY; without even  the implied warranty of  MERCHANTABILITY or
// FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for
// more details.
//
// You should have received a copy of the GNU General Public License along
// with Postern. If not, see <http://www.gnu.org/licenses/>.

use std::borrow::Cow;
use std::io;
use std::pin::Pin;
use std::str;
use std::sync::Arc;
use std::task;

use log::{info, warn};
use tokio::io::{
    AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufStream, DuplexStream,
};
use tokio::sync::mpsc;

use super::bridge::*;
use crate::codes::*;
use crate::dot::copy_dot_unstuffed;
use crate::support::{
    async_io::SessionIo, config::ServerConfig, error::Error,
    log_prefix::LogPrefix,
};
use crate::syntax::{Command, Param, ParseError};

const MAX_LINE: usize = 1024;

// Advertised on EHLO/LHLO. STARTTLS and AUTH are included conditionally;
// the final item must be unconditional.
static EXTENSIONS: &[&str] = &[
    "AUTH PLAIN LOGIN",
    "STARTTLS",
    "8BITMIME", // RFC 6152
    "PIPELINING",
    "SMTPUTF8", // RFC 6531
];

/// Runs one SMTP session over `io` until QUIT or transport close.
///
/// Protocol events are delivered on `events` paired with acknowledgments;
/// see the bridge module for the contract. A caller that wants an
/// accept-everything server can simply drop the receiving end.
pub async fn serve(
    io: SessionIo,
    config: Arc<ServerConfig>,
    log_prefix: LogPrefix,
    events: mpsc::Sender<Event>,
) -> Result<(), Error> {
    let mut session = Session {
        io: BufStream::new(io),
        config,
        log_prefix,
        events,
        greeting: None,
        authenticated: None,
        from: None,
        to: None,
        quit: false,
    };
    session.run().await
}

/// The self-reported identity of the remote peer.
#[derive(Clone, Debug)]
pub struct Greeting {
    /// The greeting keyword used (HELO, EHLO, or LHLO).
    pub kind: String,
    /// The host name the peer claimed.
    pub host: String,
}

/// One accepted half of the envelope: an address plus the extension
/// arguments that arrived with it.
#[derive(Clone, Debug)]
pub struct Envelope {
    pub address: String,
    pub params: Vec<Param>,
}

struct Session {
    io: BufStream<SessionIo>,
    config: Arc<ServerConfig>,
    log_prefix: LogPrefix,
    events: mpsc::Sender<Event>,

    greeting: Option<Greeting>,
    authenticated: Option<String>,
    from: Option<Envelope>,
    to: Option<Envelope>,
    quit: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResponseKind {
    /// The last in a series of responses.
    ///
    /// Indicates no continuation and forces a flush.
    Final,
    /// A non-final response that is safe to buffer.
    Delayable,
}

impl ResponseKind {
    fn or_final(self, phinal: bool) -> Self {
        if phinal {
            ResponseKind::Final
        } else {
            self
        }
    }

    fn indicator(self) -> char {
        match self {
            Final => ' ',
            Delayable => '-',
        }
    }
}

use self::ResponseKind::*;

impl Session {
    async fn run(&mut self) -> Result<(), Error> {
        self.send_banner().await?;

        let mut buffer = Vec::new();
        while !self.quit {
            self.run_command(&mut buffer).await?;
        }

        Ok(())
    }

    async fn run_command(&mut self, buffer: &mut Vec<u8>) -> Result<(), Error> {
        buffer.clear();

        (&mut self.io)
            .take(MAX_LINE as u64)
            .read_until(b'\n', buffer)
            .await?;
        if buffer.is_empty() {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "EOF reached at start of command",
            )));
        }

        if !buffer.ends_with(b"\n") {
            if buffer.len() >= MAX_LINE {
                self.send_reply(
                    Final,
                    rc::CommandSyntaxError,
                    Cow::Borrowed("Command line too long"),
                )
                .await?;

                // Skip the rest of the line
                while !buffer.is_empty() && !buffer.ends_with(b"\n") {
                    buffer.clear();
                    (&mut self.io)
                        .take(MAX_LINE as u64)
                        .read_until(b'\n', buffer)
                        .await?;
                }

                return Ok(());
            } else {
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "EOF reached within command",
                )));
            }
        }

        let line_ending_len = if buffer.ends_with(b"\r\n") { 2 } else { 1 };
        let command_line = &buffer[..buffer.len() - line_ending_len];
        if command_line.contains(&0) {
            warn!(
                "{} Remote is speaking binary, closing connection",
                self.log_prefix,
            );
            self.quit = true;
            return Ok(());
        }

        let command_line = match str::from_utf8(command_line) {
            Ok(s) => s,
            Err(_) => {
                warn!("{} Non-UTF-8 command received", self.log_prefix);
                self.send_reply(
                    Final,
                    rc::CommandSyntaxError,
                    Cow::Borrowed("Malformed UTF-8"),
                )
                .await?;
                return Ok(());
            },
        };

        let command = match command_line.parse::<Command>() {
            Ok(c) => c,
            Err(e) => {
                let mut debug_line = command_line;
                if let Some((truncate_len, _)) =
                    debug_line.char_indices().nth(64)
                {
                    debug_line = &debug_line[..truncate_len];
                }

                warn!(
                    "{} Received bad command {debug_line:?}",
                    self.log_prefix
                );

                return match e {
                    ParseError::Syntax => {
                        self.send_reply(
                            Final,
                            rc::ParameterSyntaxError,
                            Cow::Borrowed("Unknown command syntax"),
                        )
                        .await
                    },
                    ParseError::Unrecognized => {
                        self.send_reply(
                            Final,
                            rc::CommandNotImplemented,
                            Cow::Borrowed(""),
                        )
                        .await
                    },
                };
            },
        };

        match command {
            Command::Quit => self.cmd_quit().await,
            Command::Reset => self.cmd_reset().await,
            Command::StartTls => self.cmd_start_tls().await,
            Command::Helo(kind, host) => self.cmd_helo(kind, host).await,
            _ if self.greeting.is_none() => {
                self.send_reply(
                    Final,
                    rc::BadSequenceOfCommands,
                    Cow::Borrowed(
                        "Bad sequence: HELO, EHLO, or LHLO expected",
                    ),
                )
                .await
            },
            Command::Auth(mechanism, initial) => {
                self.cmd_auth(mechanism, initial).await
            },
            Command::MailFrom(return_path, params) => {
                self.cmd_mail(return_path, params).await
            },
            Command::Recipient(forward_path, params) => {
                self.cmd_recipient(forward_path, params).await
            },
            Command::Data => self.cmd_data().await,
        }
    }

    async fn cmd_quit(&mut self) -> Result<(), Error> {
        self.quit = true;
        let _ = self
            .send_reply(Final, rc::ServiceClosing, Cow::Borrowed("Bye"))
            .await;
        let _ = self.events.send(Event::Quit).await;
        Ok(())
    }

    async fn cmd_reset(&mut self) -> Result<(), Error> {
        self.from = None;
        self.to = None;
        self.send_reply(Final, rc::Ok, Cow::Borrowed("")).await?;
        let _ = self.events.send(Event::Reset).await;
        Ok(())
    }

    async fn cmd_start_tls(&mut self) -> Result<(), Error> {
        if self.io.get_ref().is_tls() {
            return self
                .send_reply(
                    Final,
                    rc::BadSequenceOfCommands,
                    Cow::Borrowed("Already using TLS"),
                )
                .await;
        }

        let config = Arc::clone(&self.config);
        let Some(ref acceptor) = config.tls else {
            return self
                .send_reply(
                    Final,
                    rc::CommandNotImplemented,
                    Cow::Borrowed("TLS not available"),
                )
                .await;
        };

        match self
            .surface(|ack| Event::StartTls(StartTlsEvent { ack }))
            .await
        {
            Verdict::Reject(reply) => self.send_rejection(reply).await,
            Verdict::Accept(reply) => {
                // The go-ahead must be flushed on the old transport before
                // the handshake starts.
                self.send_acceptance(reply, rc::ServiceReady).await?;

                info!("{} Start TLS handshake", self.log_prefix);
                self.io.get_mut().upgrade_tls(acceptor).await?;
                info!("{} TLS handshake completed", self.log_prefix);

                Ok(())
            },
        }
    }

    async fn cmd_helo(
        &mut self,
        kind: String,
        host: String,
    ) -> Result<(), Error> {
        let extended = !"HELO".eq_ignore_ascii_case(&kind);
        self.log_prefix.set_helo(host.clone());
        info!("{} SMTP {kind}", self.log_prefix);

        let tls = self.io.get_ref().tls_string();
        let verdict = self
            .surface(|ack| {
                Event::Greeting(GreetingEvent {
                    kind: kind.clone(),
                    host: host.clone(),
                    tls,
                    ack,
                })
            })
            .await;

        match verdict {
            Verdict::Reject(reply) => self.send_rejection(reply).await,
            Verdict::Accept(reply) => {
                let first = reply.unwrap_or_else(|| {
                    SmtpReply(
                        rc::Ok,
                        Cow::Owned(format!(
                            "{} salutations, {}",
                            self.config.host_name, host
                        )),
                    )
                });
                self.greeting = Some(Greeting { kind, host });
                self.send_reply(
                    Delayable.or_final(!extended),
                    first.0,
                    first.1,
                )
                .await?;

                if extended {
                    self.send_extensions().await?;
                }

                Ok(())
            },
        }
    }

    async fn send_extensions(&mut self) -> Result<(), Error> {
        let secure = self.io.get_ref().is_tls();
        for (ix, &ext) in EXTENSIONS.iter().enumerate() {
            // RFC 3207 requires not offering STARTTLS after TLS has been
            // negotiated.
            if "STARTTLS" == ext && (secure || self.config.tls.is_none()) {
                continue;
            }

            if ext.starts_with("AUTH ") && !secure {
                continue;
            }

            self.send_reply(
                Delayable.or_final(ix + 1 == EXTENSIONS.len()),
                rc::Ok,
                Cow::Borrowed(ext),
            )
            .await?;
        }

        Ok(())
    }

    async fn cmd_auth(
        &mut self,
        mechanism: String,
        initial: Option<String>,
    ) -> Result<(), Error> {
        if !self.io.get_ref().is_tls() {
            warn!("{} Rejected attempt to AUTH without TLS", self.log_prefix);
            return self
                .send_reply(
                    Final,
                    rc::BadSequenceOfCommands,
                    Cow::Borrowed("Bad sequence: STARTTLS expected"),
                )
                .await;
        }

        if self.authenticated.is_some() {
            return self
                .send_reply(
                    Final,
                    rc::BadSequenceOfCommands,
                    Cow::Borrowed("Already authenticated"),
                )
                .await;
        }

        let (user, credential) = if mechanism.eq_ignore_ascii_case("PLAIN") {
            // RFC 2595 PLAIN, the whole exchange in one base64 blob:
            // <authorise-id>NUL<authenticate-id>NUL<password>, where
            // <authorise-id> is optional if it equals <authenticate-id>.
            let blob = match initial {
                Some(blob) if blob != "=" => blob,
                _ => self.challenge(String::new()).await?,
            };

            if blob.is_empty() {
                return self
                    .send_reply(
                        Final,
                        rc::ParameterSyntaxError,
                        Cow::Borrowed(
                            "The empty string is not valid for PLAIN",
                        ),
                    )
                    .await;
            }

            if blob == "*" {
                return self.sasl_aborted().await;
            }

            let Some(decoded) = decode_sasl(&blob) else {
                return self.bad_base64().await;
            };

            let mut parts = decoded.split('\x00');
            let (Some(authorise), Some(authenticate), Some(password), None) =
                (parts.next(), parts.next(), parts.next(), parts.next())
            else {
                return self
                    .send_reply(
                        Final,
                        rc::CommandSyntaxError,
                        Cow::Borrowed("Invalid auth syntax"),
                    )
                    .await;
            };

            if !authorise.is_empty() && authorise != authenticate {
                return self
                    .send_reply(
                        Final,
                        rc::AuthenticationCredentialsInvalid,
                        Cow::Borrowed(
                            "authorise-id must match authenticate-id",
                        ),
                    )
                    .await;
            }

            (authenticate.to_owned(), password.to_owned())
        } else if mechanism.eq_ignore_ascii_case("LOGIN") {
            // RFC 4616-era LOGIN: prompt for whichever of the two values the
            // command line did not carry, one base64 line each.
            let user_b64 = match initial {
                Some(user) => user,
                None => self.challenge(base64::encode("Username:")).await?,
            };
            if user_b64 == "*" {
                return self.sasl_aborted().await;
            }
            let Some(user) = decode_sasl(&user_b64) else {
                return self.bad_base64().await;
            };

            let password_b64 =
                self.challenge(base64::encode("Password:")).await?;
            if password_b64 == "*" {
                return self.sasl_aborted().await;
            }
            let Some(credential) = decode_sasl(&password_b64) else {
                return self.bad_base64().await;
            };

            (user, credential)
        } else {
            warn!(
                "{} Rejected attempt to auth with method {mechanism:?}",
                self.log_prefix,
            );
            return self
                .send_reply(
                    Final,
                    rc::CommandParameterNotImplemented,
                    Cow::Borrowed("Unsupported AUTH mechanism"),
                )
                .await;
        };

        let verdict = self
            .surface(|ack| {
                Event::Auth(AuthEvent {
                    user: user.clone(),
                    credential: credential.clone(),
                    ack,
                })
            })
            .await;

        match verdict {
            Verdict::Reject(reply) => self.send_rejection(reply).await,
            Verdict::Accept(reply) => {
                self.log_prefix.set_user(user.clone());
                info!("{} Authenticated", self.log_prefix);
                self.authenticated = Some(user);
                self.send_acceptance(reply, rc::AuthenticationSucceeded)
                    .await
            },
        }
    }

    /// Sends a 334 challenge carrying `prompt` and reads the peer's one-line
    /// answer.
    async fn challenge(&mut self, prompt: String) -> Result<String, Error> {
        self.send_reply(Final, rc::ServerChallenge, Cow::Owned(prompt))
            .await?;

        let mut buffer = Vec::new();
        (&mut self.io)
            .take(MAX_LINE as u64)
            .read_until(b'\n', &mut buffer)
            .await?;

        if !buffer.ends_with(b"\n") {
            self.send_reply(
                Final,
                rc::CommandSyntaxError,
                Cow::Borrowed("Line too long"),
            )
            .await?;
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                "Authentication line too long",
            )));
        }

        let _ = buffer.pop();
        if Some(&b'\r') == buffer.last() {
            let _ = buffer.pop();
        }

        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }

    async fn sasl_aborted(&mut self) -> Result<(), Error> {
        self.send_reply(
            Final,
            rc::ParameterSyntaxError,
            Cow::Borrowed("SASL aborted"),
        )
        .await
    }

    async fn bad_base64(&mut self) -> Result<(), Error> {
        self.send_reply(
            Final,
            rc::CommandSyntaxError,
            Cow::Borrowed("Invalid base64"),
        )
        .await
    }

    async fn cmd_mail(
        &mut self,
        return_path: String,
        params: Vec<Param>,
    ) -> Result<(), Error> {
        let verdict = self
            .surface(|ack| {
                Event::Mail(MailEvent {
                    from: return_path.clone(),
                    params: params.clone(),
                    ack,
                })
            })
            .await;

        match verdict {
            Verdict::Reject(reply) => self.send_rejection(reply).await,
            Verdict::Accept(reply) => {
                info!(
                    "{} Start mail transaction from <{return_path}>",
                    self.log_prefix,
                );
                self.from = Some(Envelope {
                    address: return_path,
                    params,
                });
                self.send_acceptance(reply, rc::Ok).await
            },
        }
    }

    async fn cmd_recipient(
        &mut self,
        forward_path: String,
        params: Vec<Param>,
    ) -> Result<(), Error> {
        let verdict = self
            .surface(|ack| {
                Event::Recipient(RecipientEvent {
                    to: forward_path.clone(),
                    params: params.clone(),
                    ack,
                })
            })
            .await;

        match verdict {
            Verdict::Reject(reply) => self.send_rejection(reply).await,
            Verdict::Accept(reply) => {
                self.to = Some(Envelope {
                    address: forward_path,
                    params,
                });
                self.send_acceptance(reply, rc::Ok).await
            },
        }
    }

    async fn cmd_data(&mut self) -> Result<(), Error> {
        if self.from.is_none() {
            return self
                .send_reply(
                    Final,
                    rc::BadSequenceOfCommands,
                    Cow::Borrowed("Bad sequence: MAIL expected"),
                )
                .await;
        }
        if self.to.is_none() {
            return self
                .send_reply(
                    Final,
                    rc::BadSequenceOfCommands,
                    Cow::Borrowed("Bad sequence: RCPT expected"),
                )
                .await;
        }

        let (app_end, mut session_end) = tokio::io::duplex(4096);
        let (body, mut abort_rx) = MessageBody::new(app_end);

        match self
            .surface(move |ack| Event::Message(MessageEvent { body, ack }))
            .await
        {
            Verdict::Reject(reply) => return self.send_rejection(reply).await,
            Verdict::Accept(reply) => {
                self.send_acceptance(reply, rc::StartMailInput).await?;
            },
        }

        info!("{} Begin data transfer", self.log_prefix);
        copy_dot_unstuffed(
            Pin::new(&mut DiscardOnError(&mut session_end)),
            Pin::new(&mut self.io),
        )
        .await?;
        // EOF to the application.
        drop(session_end);

        if let Ok(reply) = abort_rx.try_recv() {
            info!("{} Data transfer aborted", self.log_prefix);
            self.from = None;
            self.to = None;
            return self.send_reply(Final, reply.0, reply.1).await;
        }

        let verdict = self
            .surface(|ack| Event::Received(ReceivedEvent { ack }))
            .await;

        match verdict {
            Verdict::Reject(reply) => self.send_rejection(reply).await,
            Verdict::Accept(reply) => {
                info!("{} Completed data transfer", self.log_prefix);
                self.send_acceptance(reply, rc::Ok).await
            },
        }
    }

    async fn send_banner(&mut self) -> Result<(), Error> {
        self.send_reply(
            Final,
            rc::ServiceReady,
            Cow::Owned(format!(
                "{} {} {} {}.{}.{} ready",
                self.config.host_name,
                if self.io.get_ref().is_tls() {
                    "ESMTPS"
                } else {
                    "ESMTP"
                },
                env!("CARGO_PKG_NAME"),
                env!("CARGO_PKG_VERSION_MAJOR"),
                env!("CARGO_PKG_VERSION_MINOR"),
                env!("CARGO_PKG_VERSION_PATCH"),
            )),
        )
        .await
    }

    /// Surfaces an event to the application and waits for its decision.
    ///
    /// If nothing is listening, or the listener discards the acknowledgment
    /// without resolving it, the event is accepted with its defaults.
    async fn surface(
        &mut self,
        make: impl FnOnce(Ack) -> Event,
    ) -> Verdict {
        let (ack, verdict_rx) = Ack::new();
        if self.events.send(make(ack)).await.is_err() {
            return Verdict::Accept(None);
        }

        match verdict_rx.await {
            Ok(verdict) => verdict,
            Err(_) => Verdict::Accept(None),
        }
    }

    async fn send_acceptance(
        &mut self,
        reply: Option<SmtpReply>,
        default_code: ReplyCode,
    ) -> Result<(), Error> {
        let SmtpReply(code, message) =
            reply.unwrap_or(SmtpReply(default_code, Cow::Borrowed("")));
        self.send_reply(Final, code, message).await
    }

    async fn send_rejection(
        &mut self,
        reply: Option<SmtpReply>,
    ) -> Result<(), Error> {
        let SmtpReply(code, message) = reply.unwrap_or(SmtpReply(
            rc::CommandSyntaxError,
            Cow::Borrowed("Rejected"),
        ));
        self.send_reply(Final, code, message).await
    }

    async fn send_reply(
        &mut self,
        kind: ResponseKind,
        code: ReplyCode,
        message: Cow<'_, str>,
    ) -> Result<(), Error> {
        use std::fmt::Write as _;

        if code == rc::ServiceClosing
            || code == rc::ServiceNotAvailableClosing
        {
            self.quit = true;
        }

        let message = if message.is_empty() {
            Cow::Borrowed(code.default_message())
        } else {
            message
        };

        let mut s = String::new();
        let _ = write!(
            s,
            "{}{}{}\r\n",
            code as u16,
            kind.indicator(),
            message
        );

        self.io.write_all(s.as_bytes()).await?;
        match kind {
            Final => self.io.flush().await?,
            Delayable => (),
        }

        Ok(())
    }
}

fn decode_sasl(data: &str) -> Option<String> {
    base64::decode(data)
        .ok()
        .and_then(|decoded| String::from_utf8(decoded).ok())
}

/// Wraps `DuplexStream` to silently succeed and consume all data on any
/// error, so a closed or aborted transfer target never fails the session;
/// the wire is still drained to the terminator.
struct DiscardOnError<'a>(&'a mut DuplexStream);

impl tokio::io::AsyncWrite for DiscardOnError<'_> {
    fn poll_write(
        self: Pin<&mut Self>,
        ctx: &mut task::Context<'_>,
        buf: &[u8],
    ) -> task::Poll<io::Result<usize>> {
        match Pin::new(&mut *self.get_mut().0).poll_write(ctx, buf) {
            task::Poll::Ready(Err(_)) => task::Poll::Ready(Ok(buf.len())),
            poll => poll,
        }
    }

    fn poll_flush(
        self: Pin<&mut Self>,
        ctx: &mut task::Context<'_>,
    ) -> task::Poll<io::Result<()>> {
        Pin::new(&mut *self.get_mut().0).poll_flush(ctx)
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        ctx: &mut task::Context<'_>,
    ) -> task::Poll<io::Result<()>> {
        Pin::new(&mut *self.get_mut().0).poll_shutdown(ctx)
    }
}
