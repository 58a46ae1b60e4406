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

//! Reply codes from RFC 5321 and RFC 4954.
//!
//! The module is designed to be wildcard-imported, and defines the `rc`
//! submodule for accessing the enum values in a consistent way.

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u16)]
pub enum ReplyCode {
    ServiceReady = 220,
    ServiceClosing = 221,
    AuthenticationSucceeded = 235,
    Ok = 250,
    ServerChallenge = 334,
    StartMailInput = 354,
    ServiceNotAvailableClosing = 421,
    CommandSyntaxError = 500,
    ParameterSyntaxError = 501,
    CommandNotImplemented = 502,
    BadSequenceOfCommands = 503,
    CommandParameterNotImplemented = 504,
    AuthenticationCredentialsInvalid = 535,
    ActionNotTakenPermanent = 550,
    TransactionFailed = 554,
}

pub mod rc {
    pub use super::ReplyCode::*;
}

impl ReplyCode {
    /// The stock message used when the caller supplies none.
    pub fn default_message(self) -> &'static str {
        match self {
            rc::ServiceReady => "Ready",
            rc::ServiceClosing => "Bye",
            rc::AuthenticationSucceeded => "Authentication successful",
            rc::Ok => "OK",
            // Challenge payloads are always explicit.
            rc::ServerChallenge => "",
            rc::StartMailInput => "Go ahead",
            rc::ServiceNotAvailableClosing => "Service not available",
            rc::CommandSyntaxError => "Unrecognised command",
            rc::ParameterSyntaxError => "Syntax error",
            rc::CommandNotImplemented => "Not implemented",
            rc::BadSequenceOfCommands => "Bad sequence of commands",
            rc::CommandParameterNotImplemented => {
                "Parameter not implemented"
            },
            rc::AuthenticationCredentialsInvalid => "Invalid credentials",
            rc::ActionNotTakenPermanent => "Action not taken",
            rc::TransactionFailed => "Transaction failed",
        }
    }
}
