// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Serve one host directory read-only over a short-lived HTTP endpoint.
// Author: Lukas Bower
#![forbid(unsafe_code)]

use std::fs::{self, File};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::{debug, warn};
use percent_encoding::percent_decode_str;
use tiny_http::{Header, Method, Request, Response, Server};

/// Throwaway GET/HEAD-only file server over a single directory tree.
///
/// The server binds an OS-chosen port and stops when dropped.
pub struct HttpExchange {
    server: Arc<Server>,
    addr: SocketAddr,
    worker: Option<JoinHandle<()>>,
}

impl HttpExchange {
    /// Serve `root` on an ephemeral port of `ip`.
    pub fn serve(root: &Path, ip: IpAddr) -> io::Result<Self> {
        Self::serve_on(root, SocketAddr::new(ip, 0))
    }

    /// Serve `root` on `bind`.
    pub fn serve_on(root: &Path, bind: SocketAddr) -> io::Result<Self> {
        let root = fs::canonicalize(root)?;
        let server = Server::http(bind).map_err(|err| io::Error::new(io::ErrorKind::AddrNotAvailable, err))?;
        let addr = server
            .server_addr()
            .to_ip()
            .ok_or_else(|| io::Error::new(io::ErrorKind::AddrNotAvailable, "exchange bound a non-IP address"))?;
        let server = Arc::new(server);
        let serving = Arc::clone(&server);
        let worker = thread::Builder::new()
            .name(format!("exchange-{}", addr.port()))
            .spawn(move || {
                for request in serving.incoming_requests() {
                    handle(&root, request);
                }
            })?;
        debug!("exchange listening on {addr}");
        Ok(Self {
            server,
            addr,
            worker: Some(worker),
        })
    }

    /// Bound port.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Bound socket address.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// URL a device uses to fetch `name` when it reaches the host at `host`.
    #[must_use]
    pub fn url(&self, host: &str, name: &str) -> String {
        format!("http://{host}:{}/{}", self.port(), name.trim_start_matches('/'))
    }
}

impl Drop for HttpExchange {
    fn drop(&mut self) {
        self.server.unblock();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("exchange worker on {} panicked", self.addr);
            }
        }
        debug!("exchange on {} stopped", self.addr);
    }
}

fn handle(root: &Path, request: Request) {
    let method = request.method().clone();
    let url = request.url().to_owned();
    let result = match method {
        Method::Get | Method::Head => match resolve(root, &url) {
            Some(path) => match File::open(&path) {
                Ok(file) => {
                    let mut response = Response::from_file(file);
                    if let Ok(header) = Header::from_bytes(&b"Content-Type"[..], &b"application/octet-stream"[..]) {
                        response.add_header(header);
                    }
                    request.respond(response)
                }
                Err(_) => request.respond(Response::empty(404)),
            },
            None => request.respond(Response::empty(404)),
        },
        _ => request.respond(Response::empty(405)),
    };
    debug!("exchange {method} {url}");
    if let Err(err) = result {
        debug!("exchange response for {url} failed: {err}");
    }
}

/// Map a request path onto a regular file under `root`, refusing escapes.
fn resolve(root: &Path, url: &str) -> Option<PathBuf> {
    let path = url.split(['?', '#']).next().unwrap_or_default();
    let decoded = percent_decode_str(path).decode_utf8().ok()?;
    let mut candidate = root.to_path_buf();
    for part in decoded.split('/') {
        match part {
            "" | "." => continue,
            ".." => return None,
            part if part.contains('\\') || part.contains('\0') => return None,
            part => candidate.push(part),
        }
    }
    let resolved = fs::canonicalize(&candidate).ok()?;
    (resolved.starts_with(root) && resolved.is_file()).then_some(resolved)
}
