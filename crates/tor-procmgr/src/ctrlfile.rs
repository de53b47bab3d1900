//! Parsing the file Tor writes with `ControlPortWriteToFile`.
//!
//! The file holds one `KEY=ARG` line per control listener. `UNIX_PORT`
//! lines name a unix-socket path; `PORT` lines carry `host:port`.

use tor_ctrlconn::CtrlEndpoint;

use crate::err::ProcError;

/// Pick the control endpoint out of a control-port file.
///
/// `UNIX_PORT` entries take precedence over `PORT` entries; within each
/// kind, the first usable one wins. A unix-socket entry is usable only if
/// its path still exists.
pub fn parse_control_port_file(contents: &str) -> Result<CtrlEndpoint, ProcError> {
    let mut tcp = None;
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Some((key, arg)) = line.split_once('=') else {
            continue;
        };
        match key {
            #[cfg(unix)]
            "UNIX_PORT" => {
                let path = std::path::PathBuf::from(arg);
                if path.exists() {
                    return Ok(CtrlEndpoint::Unix(path));
                }
            }
            "PORT" => {
                if tcp.is_none() {
                    tcp = arg.parse().ok();
                }
            }
            _ => {}
        }
    }
    tcp.map(CtrlEndpoint::Tcp)
        .ok_or_else(|| ProcError::CtrlFileUnparseable {
            content: contents.to_owned(),
        })
}
