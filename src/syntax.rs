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

//! Tokenisation of SMTP command lines into structured commands.

use std::str::FromStr;

use lazy_static::lazy_static;
use regex::Regex;

/// An ESMTP extension argument: `NAME` or `NAME=VALUE`.
///
/// Arguments are not interpreted here; they are handed to the application
/// verbatim with the envelope event they arrived on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Param {
    pub name: String,
    pub value: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    /// (HELO|EHLO|LHLO) origin-host ignored...
    Helo(String, String),
    /// AUTH mechanism [initial-response]
    Auth(String, Option<String>),
    /// MAIL FROM:<return-path> extension-args...
    MailFrom(String, Vec<Param>),
    /// RCPT TO:<ignored-route:email> extension-args...
    Recipient(String, Vec<Param>),
    /// DATA
    Data,
    /// RSET
    Reset,
    /// QUIT
    Quit,
    /// STARTTLS
    StartTls,
}

/// Why a command line failed to parse.
///
/// `Unrecognized` lines get the not-implemented reply; `Syntax` lines carry
/// a known verb with malformed arguments and get the syntax-error reply.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParseError {
    Unrecognized,
    Syntax,
}

static SIMPLE_COMMANDS: &[(&str, Command)] = &[
    ("DATA", Command::Data),
    ("RSET", Command::Reset),
    ("QUIT", Command::Quit),
    ("STARTTLS", Command::StartTls),
];

lazy_static! {
    static ref RX_HELO: Regex =
        Regex::new("^(?i)(HELO|EHLO|LHLO) ([^ ]+)").unwrap();
    static ref RX_MAIL: Regex =
        Regex::new("^(?i)MAIL FROM:<([^>]*)>(.*)$").unwrap();
    static ref RX_RCPT: Regex =
        Regex::new("^(?i)RCPT TO:<(?:@[^:]+:)?([^>]+)>(.*)$").unwrap();
    static ref RX_AUTH: Regex =
        Regex::new("^(?i)AUTH ([A-Za-z0-9-]+)(?: ([0-9A-Za-z+/=]+))?$")
            .unwrap();
    static ref RX_KNOWN_COMMANDS: Regex = Regex::new(
        "^(?i)(DATA|RSET|QUIT|STARTTLS|HELO|EHLO|LHLO|MAIL|RCPT|AUTH)( .*)?$"
    )
    .unwrap();
}

fn parse_params(s: &str) -> Vec<Param> {
    s.split(' ')
        .filter(|p| !p.is_empty())
        .map(|p| match p.split_once('=') {
            Some((name, value)) => Param {
                name: name.to_owned(),
                value: Some(value.to_owned()),
            },
            None => Param {
                name: p.to_owned(),
                value: None,
            },
        })
        .collect()
}

impl FromStr for Command {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, ParseError> {
        for &(verb, ref cmd) in SIMPLE_COMMANDS {
            if verb.eq_ignore_ascii_case(s) {
                return Ok(cmd.clone());
            }
        }

        if let Some(cap) = RX_HELO.captures(s) {
            Ok(Command::Helo(
                cap.get(1).unwrap().as_str().to_owned(),
                cap.get(2).unwrap().as_str().to_owned(),
            ))
        } else if let Some(cap) = RX_MAIL.captures(s) {
            Ok(Command::MailFrom(
                cap.get(1).unwrap().as_str().to_owned(),
                parse_params(cap.get(2).map_or("", |c| c.as_str())),
            ))
        } else if let Some(cap) = RX_RCPT.captures(s) {
            Ok(Command::Recipient(
                cap.get(1).unwrap().as_str().to_owned(),
                parse_params(cap.get(2).map_or("", |c| c.as_str())),
            ))
        } else if let Some(cap) = RX_AUTH.captures(s) {
            Ok(Command::Auth(
                cap.get(1).unwrap().as_str().to_owned(),
                cap.get(2).map(|data| data.as_str().to_owned()),
            ))
        } else if RX_KNOWN_COMMANDS.is_match(s) {
            Err(ParseError::Syntax)
        } else {
            Err(ParseError::Unrecognized)
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn param(name: &str, value: Option<&str>) -> Param {
        Param {
            name: name.to_owned(),
            value: value.map(str::to_owned),
        }
    }

    #[test]
    fn command_parsing() {
        assert_eq!(
            Ok(Command::Helo(
                "EHLO".to_owned(),
                "foo.example.com".to_owned()
            )),
            "EHLO foo.example.com".parse()
        );
        assert_eq!(
            Ok(Command::Helo(
                "helo".to_owned(),
                "foo.example.com".to_owned()
            )),
            "helo foo.example.com some client implementation".parse()
        );
        assert_eq!(
            Ok(Command::Helo(
                "LHLO".to_owned(),
                "foo.example.com".to_owned()
            )),
            "LHLO foo.example.com".parse()
        );
        assert_eq!(Err(ParseError::Syntax), "EHLO".parse::<Command>());

        assert_eq!(
            Ok(Command::MailFrom("foo@bar.com".to_owned(), vec![])),
            "MAIL FROM:<foo@bar.com>".parse()
        );
        assert_eq!(
            Ok(Command::MailFrom(String::new(), vec![])),
            "mail from:<>".parse()
        );
        assert_eq!(
            Ok(Command::MailFrom(
                "foo@bar.com".to_owned(),
                vec![param("SIZE", Some("42")), param("BODY", Some("8BITMIME"))],
            )),
            "MAIL FROM:<foo@bar.com> SIZE=42 BODY=8BITMIME".parse()
        );
        assert_eq!(
            Ok(Command::MailFrom(
                "foo@bar.com".to_owned(),
                vec![param("FOO", None)],
            )),
            "MAIL FROM:<foo@bar.com> FOO".parse()
        );
        assert_eq!(Err(ParseError::Syntax), "MAIL FROM foo".parse::<Command>());

        assert_eq!(
            Ok(Command::Recipient("userc@d.bar.org".to_owned(), vec![])),
            "RCPT TO:<userc@d.bar.org>".parse()
        );
        assert_eq!(
            Ok(Command::Recipient("userc@d.bar.org".to_owned(), vec![])),
            "rcpt to:<@hosta.int,@jkl.org:userc@d.bar.org>".parse()
        );
        assert_eq!(
            Ok(Command::Recipient(
                "userc@d.bar.org".to_owned(),
                vec![param("NOTIFY", Some("NEVER"))],
            )),
            "RCPT TO:<userc@d.bar.org> NOTIFY=NEVER".parse()
        );

        assert_eq!(Ok(Command::Data), "DATA".parse());
        assert_eq!(Ok(Command::Data), "data".parse());
        assert_eq!(Err(ParseError::Syntax), "DATA DATA".parse::<Command>());
        assert_eq!(
            Err(ParseError::Unrecognized),
            "DATABASE".parse::<Command>()
        );

        assert_eq!(Ok(Command::Reset), "RSET".parse());
        assert_eq!(Err(ParseError::Syntax), "RSET FOO".parse::<Command>());

        assert_eq!(Ok(Command::Quit), "QUIT".parse());
        assert_eq!(Ok(Command::StartTls), "starttls".parse());
        assert_eq!(Err(ParseError::Syntax), "STARTTLS 1.3".parse::<Command>());

        assert_eq!(
            Ok(Command::Auth(
                "PLAIN".to_owned(),
                Some("AGF6dXJlAGh1bnRlcjI+//=".to_owned()),
            )),
            "AUTH PLAIN AGF6dXJlAGh1bnRlcjI+//=".parse::<Command>(),
        );
        assert_eq!(
            Ok(Command::Auth("LOGIN".to_owned(), None)),
            "auth LOGIN".parse::<Command>(),
        );

        assert_eq!(
            Err(ParseError::Unrecognized),
            "FROB ME".parse::<Command>()
        );
        assert_eq!(
            Err(ParseError::Unrecognized),
            "GET / HTTP/1.0".parse::<Command>()
        );
    }
}
