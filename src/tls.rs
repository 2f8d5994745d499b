// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! Mutual TLS for the agent protocol and the peer protocol.
//!
//! Every member of the cluster holds a certificate signed by the cluster CA. Servers only accept
//! clients presenting such a certificate, and clients only accept servers presenting one for the
//! name returned by `default_server_name()`.

use std::{fmt, fs::File, io, io::BufReader, sync::Arc};

use {
    rustls::{
        pki_types::{CertificateDer, PrivateKeyDer, ServerName},
        server::WebPkiClientVerifier,
        ClientConfig, RootCertStore, ServerConfig,
    },
    tokio::{
        io::{AsyncRead, AsyncWrite},
        net::TcpStream,
    },
    tokio_rustls::{TlsAcceptor, TlsConnector},
};

/// Any stream a protocol can run over: plain TCP or TLS on either side.
pub trait Connection: AsyncRead + AsyncWrite + Unpin + Send {}

impl<S: AsyncRead + AsyncWrite + Unpin + Send> Connection for S {}

pub type BoxedConnection = Box<dyn Connection>;

fn other(e: impl fmt::Display) -> io::Error {
    io::Error::new(io::ErrorKind::Other, e.to_string())
}

/// The certificate, key and CA files a cluster member identifies itself with.
#[derive(Debug, Clone)]
pub struct TlsFiles {
    pub ca: String,
    pub cert: String,
    pub key: String,
}

impl TlsFiles {
    /// The control service's own certificate.
    pub fn control_service() -> Self {
        TlsFiles {
            ca: crate::default_ca_cert(),
            cert: crate::default_server_cert(),
            key: crate::default_server_key(),
        }
    }

    /// A node's certificate, used both to reach the control service and between peers.
    pub fn node() -> Self {
        TlsFiles {
            ca: crate::default_ca_cert(),
            cert: crate::default_client_cert(),
            key: crate::default_client_key(),
        }
    }
}

pub fn load_certs(path: &str) -> io::Result<Vec<CertificateDer<'static>>> {
    let mut reader = BufReader::new(File::open(path)?);
    let certs = rustls_pemfile::certs(&mut reader).collect::<io::Result<Vec<_>>>()?;
    if certs.is_empty() {
        return Err(other(format!("no certificates found in '{path}'")));
    }
    Ok(certs)
}

pub fn load_key(path: &str) -> io::Result<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(File::open(path)?);
    rustls_pemfile::private_key(&mut reader)?
        .ok_or_else(|| other(format!("no private key found in '{path}'")))
}

fn root_store(path: &str) -> io::Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(path)? {
        roots.add(cert).map_err(other)?;
    }
    Ok(roots)
}

pub fn get_acceptor(files: &TlsFiles) -> io::Result<TlsAcceptor> {
    let verifier = WebPkiClientVerifier::builder(Arc::new(root_store(&files.ca)?))
        .build()
        .map_err(other)?;
    let config = ServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_single_cert(load_certs(&files.cert)?, load_key(&files.key)?)
        .map_err(other)?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

pub fn get_connector(files: &TlsFiles) -> io::Result<TlsConnector> {
    let config = ClientConfig::builder()
        .with_root_certificates(root_store(&files.ca)?)
        .with_client_auth_cert(load_certs(&files.cert)?, load_key(&files.key)?)
        .map_err(other)?;
    Ok(TlsConnector::from(Arc::new(config)))
}

/// Opens outgoing connections, with or without TLS.
#[derive(Clone)]
pub enum Connector {
    Plain,
    Mtls {
        connector: TlsConnector,
        domain: ServerName<'static>,
    },
}

impl fmt::Debug for Connector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Connector::Plain => write!(f, "Plain"),
            Connector::Mtls { domain, .. } => write!(f, "Mtls({domain:?})"),
        }
    }
}

impl Connector {
    pub fn new(mtls: bool, files: &TlsFiles) -> io::Result<Self> {
        if !mtls {
            return Ok(Connector::Plain);
        }
        let domain = ServerName::try_from(crate::default_server_name()).map_err(other)?;
        Ok(Connector::Mtls {
            connector: get_connector(files)?,
            domain,
        })
    }

    pub async fn connect(&self, address: &str) -> io::Result<BoxedConnection> {
        let stream = TcpStream::connect(address).await?;
        stream.set_nodelay(true)?;
        match self {
            Connector::Plain => Ok(Box::new(stream)),
            Connector::Mtls { connector, domain } => {
                let stream = connector.connect(domain.clone(), stream).await?;
                Ok(Box::new(stream))
            }
        }
    }
}

/// Wraps incoming connections, with or without TLS.
#[derive(Clone)]
pub enum Acceptor {
    Plain,
    Mtls(TlsAcceptor),
}

impl fmt::Debug for Acceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Acceptor::Plain => write!(f, "Plain"),
            Acceptor::Mtls(_) => write!(f, "Mtls"),
        }
    }
}

impl Acceptor {
    pub fn new(mtls: bool, files: &TlsFiles) -> io::Result<Self> {
        if mtls {
            Ok(Acceptor::Mtls(get_acceptor(files)?))
        } else {
            Ok(Acceptor::Plain)
        }
    }

    pub async fn accept(&self, stream: TcpStream) -> io::Result<BoxedConnection> {
        stream.set_nodelay(true)?;
        match self {
            Acceptor::Plain => Ok(Box::new(stream)),
            Acceptor::Mtls(acceptor) => Ok(Box::new(acceptor.accept(stream).await?)),
        }
    }
}
