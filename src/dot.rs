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

//! The dot-stuffing transform used for message bodies.
//!
//! A line consisting of just `.` terminates the body; a content line
//! beginning with `.` travels with one extra `.` prepended. Both directions
//! here operate incrementally: the terminator and the escape may straddle
//! any read boundary.

use std::io;
use std::pin::Pin;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt};

/// Copies `src` to `dst`, stripping dot stuffing, consuming up to and
/// including the line with just `.`.
///
/// The terminator is recognised in both `.\r\n` and `.\n` forms. Content
/// bytes pass through unchanged apart from the stripped escape dots. EOF
/// before the terminator is an error; nothing past the terminator is read.
pub async fn copy_dot_unstuffed(
    mut dst: Pin<&mut impl AsyncWriteExt>,
    mut src: Pin<&mut impl AsyncBufReadExt>,
) -> io::Result<()> {
    // Whether the next read starts at the beginning of a line; i.e., true at
    // the beginning of text and after each line feed.
    let mut start_of_line = true;

    loop {
        let mut src_pin = src.as_mut();
        let mut buffer = src_pin.fill_buf().await?;
        if buffer.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "EOF encountered in message payload",
            ));
        }

        // Work on at most one line at a time so the start-of-line state
        // stays accurate.
        if let Some(eol) = memchr::memchr(b'\n', buffer) {
            buffer = &buffer[..=eol];
        }

        let buffer_len = buffer.len();

        if start_of_line {
            if b".\r\n" == buffer || b".\n" == buffer {
                // End of content.
                src.as_mut().consume(buffer_len);
                return Ok(());
            }

            if b".\r" == buffer {
                // Maybe end of content, if we can get a \n next.
                src.as_mut().consume(buffer_len);

                let mut extra = [0u8; 1];
                src.as_mut().read_exact(&mut extra).await?;
                if b'\n' == extra[0] {
                    return Ok(());
                }

                // Nope, keep going. The isolated . at the start of the line
                // is illegal, so whether or not we include it is moot.
                dst.as_mut().write_all(b"\r").await?;
                dst.as_mut().write_all(&extra).await?;
                start_of_line = false;
                continue;
            }

            if b"." == buffer {
                // Could be end of content or a stuffed dot.
                src.as_mut().consume(buffer_len);

                let mut extra = [0u8; 2];
                src.as_mut().read_exact(&mut extra[..1]).await?;
                if b'\n' == extra[0] {
                    return Ok(());
                }

                src.as_mut().read_exact(&mut extra[1..]).await?;
                if b"\r\n" == &extra {
                    return Ok(());
                }

                // Either dot stuffing (extra[0] is '.') or an illegal lone
                // dot; the leading dot is dropped in both cases. extra[0] is
                // known not to be '\n', so the only possible line ending is
                // at the end of `extra`.
                dst.as_mut().write_all(&extra).await?;
                start_of_line = extra.ends_with(b"\n");
                continue;
            }
        }

        // Everything inside buffer is content, except possibly a leading '.'.
        let line_contents = if b'.' == buffer[0] && start_of_line {
            &buffer[1..]
        } else {
            buffer
        };
        dst.as_mut().write_all(line_contents).await?;

        start_of_line = buffer.ends_with(b"\n");
        src.as_mut().consume(buffer_len);
    }
}

/// Copies `src` to `dst`, applying dot stuffing and writing the final `.`
/// terminator line.
///
/// Content lines beginning with `.` gain one extra `.`; a body that does not
/// end with a line feed gets a CRLF appended before the terminator so the
/// terminator always stands on its own line.
pub async fn copy_dot_stuffed(
    mut dst: Pin<&mut impl AsyncWriteExt>,
    mut src: Pin<&mut impl AsyncBufReadExt>,
) -> io::Result<()> {
    let mut start_of_line = true;

    loop {
        let mut src_pin = src.as_mut();
        let mut buffer = src_pin.fill_buf().await?;
        if buffer.is_empty() {
            break;
        }

        if let Some(eol) = memchr::memchr(b'\n', buffer) {
            buffer = &buffer[..=eol];
        }

        let buffer_len = buffer.len();

        if start_of_line && b'.' == buffer[0] {
            dst.as_mut().write_all(b".").await?;
        }
        dst.as_mut().write_all(buffer).await?;

        start_of_line = buffer.ends_with(b"\n");
        src.as_mut().consume(buffer_len);
    }

    if !start_of_line {
        dst.as_mut().write_all(b"\r\n").await?;
    }
    dst.as_mut().write_all(b".\r\n").await?;
    Ok(())
}
