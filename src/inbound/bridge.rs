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

//! The bridge between the protocol session and the application.
//!
//! The session and the application are modelled as separate actors so the
//! application can be a single async function receiving events, which gives
//! it the flexibility to defer each decision (for example for asynchronous
//! validation) and to stream the delivered message body.
//!
//! Every event that represents an SMTP step carries an [`Ack`]; the session
//! suspends until the acknowledgment resolves. Dropping the acknowledgment
//! unresolved, or dropping the event receiver entirely, accepts the step
//! with its default reply, so an application with no opinion about an event
//! simply ignores it.

use std::borrow::Cow;
use std::io;
use std::pin::Pin;
use std::task;

use tokio::io::{AsyncRead, DuplexStream, ReadBuf};
use tokio::sync::oneshot;

use crate::codes::*;
use crate::syntax::Param;

/// A reply line: status code plus human-readable text.
///
/// An empty text is replaced by the code's stock message when the line is
/// written.
#[derive(Clone, Debug)]
pub struct SmtpReply(pub ReplyCode, pub Cow<'static, str>);

/// The application's decision about an acknowledged event.
#[derive(Debug)]
pub(crate) enum Verdict {
    Accept(Option<SmtpReply>),
    Reject(Option<SmtpReply>),
}

/// The accept/reject capability attached to a protocol event.
///
/// Exactly one of `accept`/`reject` takes effect; any call after the first
/// is a silent no-op. While the `Ack` is alive and undecided the session
/// stays suspended, which is the mechanism for pausing the protocol during
/// asynchronous validation.
pub struct Ack {
    verdict: Option<oneshot::Sender<Verdict>>,
}

impl Ack {
    pub(crate) fn new() -> (Self, oneshot::Receiver<Verdict>) {
        let (tx, rx) = oneshot::channel();
        (Self { verdict: Some(tx) }, rx)
    }

    /// Accepts the step with the event's default reply.
    pub fn accept(&mut self) {
        self.resolve(Verdict::Accept(None));
    }

    /// Accepts the step with an explicit reply.
    pub fn accept_with(
        &mut self,
        code: ReplyCode,
        message: impl Into<Cow<'static, str>>,
    ) {
        self.resolve(Verdict::Accept(Some(SmtpReply(code, message.into()))));
    }

    /// Rejects the step with the default 500 reply. No session state is
    /// mutated by a rejected step.
    pub fn reject(&mut self) {
        self.resolve(Verdict::Reject(None));
    }

    /// Rejects the step with an explicit reply.
    pub fn reject_with(
        &mut self,
        code: ReplyCode,
        message: impl Into<Cow<'static, str>>,
    ) {
        self.resolve(Verdict::Reject(Some(SmtpReply(code, message.into()))));
    }

    fn resolve(&mut self, verdict: Verdict) {
        if let Some(tx) = self.verdict.take() {
            let _ = tx.send(verdict);
        }
    }
}

/// The message transfer target opened for the duration of one DATA
/// transaction.
///
/// Reading yields the already-unstuffed body; EOF means the peer sent the
/// terminator. `abort` consumes the target, so an aborted transfer can
/// never yield further data; the session keeps consuming the wire until the
/// terminator and then reports the abort reply to the peer.
pub struct MessageBody {
    data: DuplexStream,
    abort: Option<oneshot::Sender<SmtpReply>>,
}

impl MessageBody {
    pub(crate) fn new(
        data: DuplexStream,
    ) -> (Self, oneshot::Receiver<SmtpReply>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                data,
                abort: Some(tx),
            },
            rx,
        )
    }

    /// Aborts the transfer with the default 554 reply.
    pub fn abort(self) {
        self.abort_with(rc::TransactionFailed, "");
    }

    /// Aborts the transfer with an explicit reply.
    pub fn abort_with(
        mut self,
        code: ReplyCode,
        message: impl Into<Cow<'static, str>>,
    ) {
        if let Some(tx) = self.abort.take() {
            let _ = tx.send(SmtpReply(code, message.into()));
        }
    }
}

impl AsyncRead for MessageBody {
    fn poll_read(
        self: Pin<&mut Self>,
        ctx: &mut task::Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> task::Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().data).poll_read(ctx, buf)
    }
}

/// The HELO/EHLO/LHLO command.
///
/// This may occur more than once on a connection; in particular it repeats
/// after a STARTTLS upgrade.
pub struct GreetingEvent {
    /// The greeting keyword as the peer spelled it.
    pub kind: String,
    /// The host name the peer claims for itself.
    pub host: String,
    /// A description of the TLS session, if the connection is encrypted.
    pub tls: Option<String>,
    pub ack: Ack,
}

/// A STARTTLS command. Accepting triggers the in-band TLS upgrade; the
/// accept reply goes out on the plaintext transport first.
pub struct StartTlsEvent {
    pub ack: Ack,
}

/// A completed AUTH exchange, credentials decoded.
pub struct AuthEvent {
    pub user: String,
    pub credential: String,
    pub ack: Ack,
}

/// A `MAIL FROM` command.
pub struct MailEvent {
    pub from: String,
    pub params: Vec<Param>,
    pub ack: Ack,
}

/// An `RCPT TO` command.
pub struct RecipientEvent {
    pub to: String,
    pub params: Vec<Param>,
    pub ack: Ack,
}

/// A DATA command with the envelope complete.
///
/// Accepting sends the 354 go-ahead and starts streaming the body into
/// `body`; rejecting discards the transaction without reading any body.
pub struct MessageEvent {
    pub body: MessageBody,
    pub ack: Ack,
}

/// The message body arrived in full and the transfer was not aborted.
pub struct ReceivedEvent {
    pub ack: Ack,
}

pub enum Event {
    Greeting(GreetingEvent),
    StartTls(StartTlsEvent),
    Auth(AuthEvent),
    Mail(MailEvent),
    Recipient(RecipientEvent),
    Message(MessageEvent),
    Received(ReceivedEvent),
    /// An accepted RSET; the envelope has been cleared. Notification only.
    Reset,
    /// The peer said QUIT; the session is closing. Notification only.
    Quit,
}
