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

//! Outbound connection failover across a domain's mail exchangers.
//!
//! Candidates are tried strictly sequentially in preference order; the
//! first exchanger that accepts a connection wins and later ones are never
//! dialled. Parallel dialling would shave latency but requires cleaning up
//! the losing connections, which this deliberately avoids.

use std::future::Future;
use std::io;

use log::{info, warn};
use rand::seq::SliceRandom;
use thiserror::Error;
use tokio::net::TcpStream;

pub use hickory_resolver::Name;

pub type Resolver = hickory_resolver::AsyncResolver<
    hickory_resolver::name_server::GenericConnector<
        hickory_resolver::name_server::TokioRuntimeProvider,
    >,
>;

const SMTP_PORT: u16 = 25;

/// One mail exchanger candidate for a domain.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MxCandidate {
    pub exchange: Name,
    /// Lower values are preferred.
    pub preference: u16,
}

#[derive(Error, Debug)]
pub enum MxError {
    #[error("MX resolution for {domain} failed: {source}")]
    Resolve {
        domain: String,
        source: hickory_resolver::error::ResolveError,
    },
    #[error("no MX records for {domain}")]
    NoRecords { domain: String },
    #[error(
        "could not connect to any mail exchanger for {domain} \
         ({attempts} tried)"
    )]
    NoServerReached { domain: String, attempts: usize },
}

/// Connects to the most preferred reachable mail exchanger for `domain`.
///
/// Resolution failures and empty record sets fail immediately without any
/// connection attempt. Individual connection failures move on to the next
/// candidate; only when every candidate has failed is the aggregate
/// `NoServerReached` returned.
pub async fn connect_mx(
    resolver: &Resolver,
    domain: &str,
) -> Result<TcpStream, MxError> {
    let candidates = resolve_candidates(resolver, domain).await?;
    try_candidates(domain, candidates, |host| async move {
        TcpStream::connect((host.as_str(), SMTP_PORT)).await
    })
    .await
}

async fn resolve_candidates(
    resolver: &Resolver,
    domain: &str,
) -> Result<Vec<MxCandidate>, MxError> {
    let lookup = match resolver.mx_lookup(domain).await {
        Ok(lookup) => lookup,
        Err(e) => {
            return Err(
                if matches!(
                    e.kind(),
                    hickory_resolver::error::ResolveErrorKind::NoRecordsFound {
                        ..
                    }
                ) {
                    MxError::NoRecords {
                        domain: domain.to_owned(),
                    }
                } else {
                    MxError::Resolve {
                        domain: domain.to_owned(),
                        source: e,
                    }
                },
            );
        },
    };

    let candidates = lookup
        .iter()
        .map(|mx| MxCandidate {
            exchange: mx.exchange().clone(),
            preference: mx.preference(),
        })
        .collect::<Vec<_>>();
    order_candidates(domain, candidates)
}

/// Sorts the candidate list most-preferred first, or fails if it is empty.
///
/// Equal-preference records are shuffled before the stable sort so load
/// spreads across equivalent exchangers.
fn order_candidates(
    domain: &str,
    mut candidates: Vec<MxCandidate>,
) -> Result<Vec<MxCandidate>, MxError> {
    if candidates.is_empty() {
        return Err(MxError::NoRecords {
            domain: domain.to_owned(),
        });
    }

    candidates.shuffle(&mut rand::thread_rng());
    candidates.sort_by_key(|c| c.preference);
    Ok(candidates)
}

/// Walks `candidates` in order, returning the first successful connection.
///
/// Generic over the connector so tests can drive the walk without a
/// network.
async fn try_candidates<C, F, Fut>(
    domain: &str,
    candidates: Vec<MxCandidate>,
    mut connect: F,
) -> Result<C, MxError>
where
    F: FnMut(String) -> Fut,
    Fut: Future<Output = io::Result<C>>,
{
    let attempts = candidates.len();
    for candidate in candidates {
        let host = candidate
            .exchange
            .to_utf8()
            .trim_end_matches('.')
            .to_owned();

        match connect(host.clone()).await {
            Ok(connection) => {
                info!(
                    "Connected to mail exchanger {host} \
                     (preference {}) for {domain}",
                    candidate.preference,
                );
                return Ok(connection);
            },
            Err(e) => {
                warn!(
                    "Mail exchanger {host} for {domain} unreachable: {e}"
                );
            },
        }
    }

    Err(MxError::NoServerReached {
        domain: domain.to_owned(),
        attempts,
    })
}

#[cfg(test)]
mod test {
    use std::cell::RefCell;

    use super::*;

    fn candidates(records: &[(&str, u16)]) -> Vec<MxCandidate> {
        records
            .iter()
            .map(|&(host, preference)| MxCandidate {
                exchange: Name::from_ascii(host).unwrap(),
                preference,
            })
            .collect()
    }

    #[tokio::main(flavor = "current_thread")]
    async fn run_failover(
        records: &[(&str, u16)],
        ok_hosts: &[&str],
    ) -> (Result<String, MxError>, Vec<String>) {
        let ordered =
            order_candidates("example.com", candidates(records)).unwrap();
        let attempts = RefCell::new(Vec::<String>::new());

        let result = try_candidates("example.com", ordered, |host| {
            attempts.borrow_mut().push(host.clone());
            let ok = ok_hosts.iter().any(|&o| o == host);
            async move {
                if ok {
                    Ok(host)
                } else {
                    Err(io::Error::new(
                        io::ErrorKind::ConnectionRefused,
                        "connection refused",
                    ))
                }
            }
        })
        .await;

        (result, attempts.into_inner())
    }

    #[test]
    fn candidates_ordered_by_ascending_preference() {
        let ordered = order_candidates(
            "example.com",
            candidates(&[("b", 20), ("a", 10), ("c", 30)]),
        )
        .unwrap();
        assert_eq!(
            vec![10, 20, 30],
            ordered.iter().map(|c| c.preference).collect::<Vec<_>>(),
        );
    }

    #[test]
    fn zero_records_fail_without_any_attempt() {
        assert_matches!(
            Err(MxError::NoRecords { .. }),
            order_candidates("example.com", vec![]),
        );
    }

    #[test]
    fn most_preferred_exchanger_tried_first() {
        let (result, attempts) = run_failover(&[("b", 20), ("a", 10)], &["a"]);
        assert_eq!("a", result.unwrap());
        assert_eq!(vec!["a".to_owned()], attempts);
    }

    #[test]
    fn failure_moves_to_next_candidate() {
        let (result, attempts) = run_failover(&[("b", 20), ("a", 10)], &["b"]);
        assert_eq!("b", result.unwrap());
        assert_eq!(vec!["a".to_owned(), "b".to_owned()], attempts);
    }

    #[test]
    fn exhausted_candidates_aggregate_into_one_failure() {
        let (result, attempts) = run_failover(&[("b", 20), ("a", 10)], &[]);
        assert_matches!(
            Err(MxError::NoServerReached {
                attempts: 2,
                ..
            }),
            result,
        );
        assert_eq!(vec!["a".to_owned(), "b".to_owned()], attempts);
    }
}
