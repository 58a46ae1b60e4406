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

use openssl::ssl::SslAcceptor;

/// Process-wide configuration shared by every session.
///
/// This is the only state shared between sessions; everything else lives in
/// the per-connection session object.
pub struct ServerConfig {
    /// The host name announced in the banner and greeting replies.
    pub host_name: String,
    /// The acceptor used for STARTTLS upgrades.
    ///
    /// When absent, STARTTLS is refused and never advertised.
    pub tls: Option<SslAcceptor>,
}
