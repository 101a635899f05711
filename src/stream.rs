//! Transport codec chain: compression framing and TLS setup
//!
//! Egress compression is frame-per-batch: every flushed batch becomes a
//! self-contained gzip member / lz4 frame / snappy frame, which
//! concatenate into a valid stream for standard decompressors. Ingress
//! decompression is incremental so a slow client can trickle bytes.

use std::io::{self, Read, Write};
use std::sync::Arc;

use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use flate2::{Decompress, FlushDecompress, Status};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::error::RelayError;

/// Wire compression applied to a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WireCompression {
    #[default]
    Plain,
    Gzip,
    Lz4,
    Snappy,
}

impl WireCompression {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            WireCompression::Plain => "plain",
            WireCompression::Gzip => "gzip",
            WireCompression::Lz4 => "lz4",
            WireCompression::Snappy => "snappy",
        }
    }
}

/// Compresses one outgoing batch into a self-contained frame.
pub fn compress_batch(compression: WireCompression, data: &[u8]) -> io::Result<Vec<u8>> {
    match compression {
        WireCompression::Plain => Ok(data.to_vec()),
        WireCompression::Gzip => {
            let mut enc = GzEncoder::new(Vec::new(), flate2::Compression::default());
            enc.write_all(data)?;
            enc.finish()
        }
        WireCompression::Lz4 => {
            let mut enc = lz4_flex::frame::FrameEncoder::new(Vec::new());
            enc.write_all(data)?;
            enc.finish().map_err(io::Error::other)
        }
        WireCompression::Snappy => {
            let mut enc = snap::write::FrameEncoder::new(Vec::new());
            enc.write_all(data)?;
            enc.into_inner().map_err(|e| io::Error::other(e.to_string()))
        }
    }
}

/// Incremental decompressor for one ingress connection.
pub enum IngressDecoder {
    Plain,
    Gzip {
        phase: GzipPhase,
        state: Decompress,
        pending: Vec<u8>,
    },
    /// Frame-parsing decoders buffer compressed bytes until a complete
    /// block is available.
    Lz4 {
        pending: Vec<u8>,
        header: Option<Lz4FrameHeader>,
        /// Trailing window of decoded output; linked-mode blocks
        /// back-reference into it.
        window: Vec<u8>,
    },
    Snappy {
        pending: Vec<u8>,
    },
}

/// Where we are inside a gzip member. The member framing is parsed by
/// hand so the deflate body can stream through [`Decompress`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GzipPhase {
    Header,
    Body,
    /// CRC32 + ISIZE after the deflate stream.
    Trailer(usize),
}

#[derive(Debug, Clone, Copy)]
pub struct Lz4FrameHeader {
    block_checksums: bool,
    content_checksum: bool,
    max_block_size: usize,
}

impl IngressDecoder {
    #[must_use]
    pub fn new(compression: WireCompression) -> Self {
        match compression {
            WireCompression::Plain => IngressDecoder::Plain,
            WireCompression::Gzip => IngressDecoder::Gzip {
                phase: GzipPhase::Header,
                state: Decompress::new(false),
                pending: Vec::new(),
            },
            WireCompression::Lz4 => IngressDecoder::Lz4 {
                pending: Vec::new(),
                header: None,
                window: Vec::new(),
            },
            WireCompression::Snappy => IngressDecoder::Snappy { pending: Vec::new() },
        }
    }

    /// Feeds raw wire bytes, appending decompressed bytes to `out`.
    pub fn feed(&mut self, input: &[u8], out: &mut Vec<u8>) -> io::Result<()> {
        match self {
            IngressDecoder::Plain => {
                out.extend_from_slice(input);
                Ok(())
            }
            IngressDecoder::Gzip {
                phase,
                state,
                pending,
            } => feed_gzip(phase, state, pending, input, out),
            IngressDecoder::Lz4 {
                pending,
                header,
                window,
            } => {
                pending.extend_from_slice(input);
                decode_lz4_frames(pending, header, window, out)
            }
            IngressDecoder::Snappy { pending } => {
                pending.extend_from_slice(input);
                decode_snappy_frames(pending, out)
            }
        }
    }
}

/// Streams one or more concatenated gzip members: the member framing is
/// parsed here, the deflate body runs through [`Decompress`].
fn feed_gzip(
    phase: &mut GzipPhase,
    state: &mut Decompress,
    pending: &mut Vec<u8>,
    mut input: &[u8],
    out: &mut Vec<u8>,
) -> io::Result<()> {
    let mut buf = [0u8; 16 * 1024];
    loop {
        match phase {
            GzipPhase::Header => {
                pending.extend_from_slice(input);
                let Some(hdrlen) = gzip_header_length(pending)? else {
                    return Ok(());
                };
                let rest = pending.split_off(hdrlen);
                pending.clear();
                *state = Decompress::new(false);
                *phase = GzipPhase::Body;
                return feed_gzip(phase, state, pending, &rest, out);
            }
            GzipPhase::Body => {
                if input.is_empty() {
                    return Ok(());
                }
                let before_in = state.total_in();
                let before_out = state.total_out();
                let status = state
                    .decompress(input, &mut buf, FlushDecompress::None)
                    .map_err(io::Error::other)?;
                let consumed = (state.total_in() - before_in) as usize;
                let produced = (state.total_out() - before_out) as usize;
                out.extend_from_slice(&buf[..produced]);
                input = &input[consumed..];
                match status {
                    Status::StreamEnd => {
                        *phase = GzipPhase::Trailer(8);
                    }
                    Status::Ok | Status::BufError => {
                        if consumed == 0 && produced == 0 {
                            return Ok(());
                        }
                    }
                }
            }
            GzipPhase::Trailer(remaining) => {
                let skip = (*remaining).min(input.len());
                input = &input[skip..];
                *remaining -= skip;
                if *remaining == 0 {
                    // a concatenated member may follow
                    *phase = GzipPhase::Header;
                }
                if input.is_empty() {
                    return Ok(());
                }
            }
        }
    }
}

/// Length of a complete gzip member header at the front of `data`, or
/// `None` when more bytes are needed.
fn gzip_header_length(data: &[u8]) -> io::Result<Option<usize>> {
    if data.len() < 10 {
        return Ok(None);
    }
    if data[0] != 0x1f || data[1] != 0x8b {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "bad gzip magic",
        ));
    }
    if data[2] != 8 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "unsupported gzip compression method",
        ));
    }
    let flags = data[3];
    let mut at = 10usize;
    if flags & 0x04 != 0 {
        // FEXTRA
        if data.len() < at + 2 {
            return Ok(None);
        }
        let xlen = usize::from(data[at]) | (usize::from(data[at + 1]) << 8);
        at += 2 + xlen;
        if data.len() < at {
            return Ok(None);
        }
    }
    for flag in [0x08u8, 0x10] {
        // FNAME, FCOMMENT: zero-terminated
        if flags & flag != 0 {
            match data[at..].iter().position(|&b| b == 0) {
                Some(end) => at += end + 1,
                None => return Ok(None),
            }
        }
    }
    if flags & 0x02 != 0 {
        // FHCRC
        at += 2;
        if data.len() < at {
            return Ok(None);
        }
    }
    Ok(Some(at))
}

const LZ4_MAGIC: u32 = 0x184D_2204;

/// Consumes as many complete lz4 frame elements from `pending` as are
/// available. Partial headers/blocks stay buffered for the next feed.
fn decode_lz4_frames(
    pending: &mut Vec<u8>,
    header: &mut Option<Lz4FrameHeader>,
    window: &mut Vec<u8>,
    out: &mut Vec<u8>,
) -> io::Result<()> {
    loop {
        if header.is_none() {
            // frame header: magic, FLG, BD, optional content size /
            // dict id, HC
            if pending.len() < 7 {
                return Ok(());
            }
            let magic = u32::from_le_bytes([pending[0], pending[1], pending[2], pending[3]]);
            if magic != LZ4_MAGIC {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "bad lz4 frame magic",
                ));
            }
            let flg = pending[4];
            let bd = pending[5];
            if flg >> 6 != 0b01 {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "unsupported lz4 frame version",
                ));
            }
            let mut hdrlen = 7usize;
            if flg & 0x08 != 0 {
                hdrlen += 8; // content size
            }
            if flg & 0x01 != 0 {
                hdrlen += 4; // dictionary id
            }
            if pending.len() < hdrlen {
                return Ok(());
            }
            let max_block_size = match (bd >> 4) & 0x07 {
                4 => 64 * 1024,
                5 => 256 * 1024,
                6 => 1024 * 1024,
                7 => 4 * 1024 * 1024,
                _ => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "bad lz4 block size descriptor",
                    ))
                }
            };
            *header = Some(Lz4FrameHeader {
                block_checksums: flg & 0x10 != 0,
                content_checksum: flg & 0x04 != 0,
                max_block_size,
            });
            pending.drain(..hdrlen);
        }

        let hdr = header.unwrap();
        if pending.len() < 4 {
            return Ok(());
        }
        let word = u32::from_le_bytes([pending[0], pending[1], pending[2], pending[3]]);
        if word == 0 {
            // end mark, optionally followed by a content checksum
            let tail = if hdr.content_checksum { 8 } else { 4 };
            if pending.len() < tail {
                return Ok(());
            }
            pending.drain(..tail);
            *header = None;
            window.clear();
            continue;
        }
        let uncompressed = word & 0x8000_0000 != 0;
        let blocklen = (word & 0x7FFF_FFFF) as usize;
        let mut need = 4 + blocklen;
        if hdr.block_checksums {
            need += 4;
        }
        if pending.len() < need {
            return Ok(());
        }
        let block = &pending[4..4 + blocklen];
        if uncompressed {
            window.extend_from_slice(block);
            out.extend_from_slice(block);
        } else {
            let decoded =
                lz4_flex::block::decompress_with_dict(block, hdr.max_block_size, window)
                    .map_err(io::Error::other)?;
            window.extend_from_slice(&decoded);
            out.extend_from_slice(&decoded);
        }
        // only the last 64 KiB can be back-referenced
        if window.len() > 64 * 1024 {
            let excess = window.len() - 64 * 1024;
            window.drain(..excess);
        }
        pending.drain(..need);
    }
}

/// Consumes complete snappy framing-format chunks from `pending`.
fn decode_snappy_frames(pending: &mut Vec<u8>, out: &mut Vec<u8>) -> io::Result<()> {
    loop {
        if pending.len() < 4 {
            return Ok(());
        }
        let kind = pending[0];
        let len = usize::from(pending[1])
            | (usize::from(pending[2]) << 8)
            | (usize::from(pending[3]) << 16);
        if pending.len() < 4 + len {
            return Ok(());
        }
        let chunk = &pending[4..4 + len];
        match kind {
            0xff => {} // stream identifier
            0x00 => {
                // compressed chunk: CRC-32C then snappy block
                if len < 4 {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "short snappy chunk",
                    ));
                }
                let decoded = snap::raw::Decoder::new()
                    .decompress_vec(&chunk[4..])
                    .map_err(io::Error::other)?;
                out.extend_from_slice(&decoded);
            }
            0x01 => {
                if len < 4 {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "short snappy chunk",
                    ));
                }
                out.extend_from_slice(&chunk[4..]);
            }
            0x02..=0x7f => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "unskippable snappy chunk",
                ));
            }
            _ => {} // reserved skippable
        }
        pending.drain(..4 + len);
    }
}

/// Convenience used by tests and the file sender: fully decompress a
/// byte stream of concatenated frames.
pub fn decompress_all(compression: WireCompression, data: &[u8]) -> io::Result<Vec<u8>> {
    match compression {
        WireCompression::Plain => Ok(data.to_vec()),
        WireCompression::Gzip => {
            let mut out = Vec::new();
            MultiGzDecoder::new(data).read_to_end(&mut out)?;
            Ok(out)
        }
        WireCompression::Lz4 | WireCompression::Snappy => {
            let mut dec = IngressDecoder::new(compression);
            let mut out = Vec::new();
            dec.feed(data, &mut out)?;
            Ok(out)
        }
    }
}

/// TLS settings for one egress destination.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsSettings {
    /// PEM bundle used to verify the peer; `None` disables verification.
    pub ca_file: Option<String>,
    /// Client certificate + key PEM for mTLS.
    pub cert_file: Option<String>,
    pub key_file: Option<String>,
}

mod danger {
    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::crypto::CryptoProvider;
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use rustls::{DigitallySignedStruct, SignatureScheme};
    use std::sync::Arc;

    /// Accepts any server certificate. Used when a destination is
    /// configured for TLS without a CA to verify against.
    #[derive(Debug)]
    pub struct AcceptAnyServerCert(pub Arc<CryptoProvider>);

    impl ServerCertVerifier for AcceptAnyServerCert {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, rustls::Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn verify_tls13_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            self.0.signature_verification_algorithms.supported_schemes()
        }
    }
}

fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>, RelayError> {
    let data = std::fs::read(path).map_err(|e| RelayError::Tls {
        message: format!("cannot read {path}: {e}"),
    })?;
    rustls_pemfile::certs(&mut &data[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| RelayError::Tls {
            message: format!("cannot parse certificates in {path}: {e}"),
        })
}

fn load_key(path: &str) -> Result<PrivateKeyDer<'static>, RelayError> {
    let data = std::fs::read(path).map_err(|e| RelayError::Tls {
        message: format!("cannot read {path}: {e}"),
    })?;
    rustls_pemfile::private_key(&mut &data[..])
        .map_err(|e| RelayError::Tls {
            message: format!("cannot parse key in {path}: {e}"),
        })?
        .ok_or_else(|| RelayError::Tls {
            message: format!("no private key found in {path}"),
        })
}

/// Builds the connector for an egress TLS destination.
pub fn client_connector(settings: &TlsSettings) -> Result<TlsConnector, RelayError> {
    let provider = rustls::crypto::CryptoProvider::get_default()
        .cloned()
        .unwrap_or_else(|| Arc::new(rustls::crypto::aws_lc_rs::default_provider()));

    let builder = rustls::ClientConfig::builder();
    let builder = match &settings.ca_file {
        Some(ca) => {
            let mut roots = rustls::RootCertStore::empty();
            for cert in load_certs(ca)? {
                roots.add(cert).map_err(|e| RelayError::Tls {
                    message: format!("bad CA certificate in {ca}: {e}"),
                })?;
            }
            builder.with_root_certificates(roots)
        }
        None => builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(danger::AcceptAnyServerCert(provider))),
    };

    let config = match (&settings.cert_file, &settings.key_file) {
        (Some(cert), Some(key)) => builder
            .with_client_auth_cert(load_certs(cert)?, load_key(key)?)
            .map_err(|e| RelayError::Tls {
                message: format!("client certificate rejected: {e}"),
            })?,
        _ => builder.with_no_client_auth(),
    };

    Ok(TlsConnector::from(Arc::new(config)))
}

/// Builds the acceptor for a TLS listener. `client_ca` switches on
/// mTLS: peers must present a certificate chaining to it.
pub fn server_acceptor(
    cert_file: &str,
    key_file: &str,
    client_ca: Option<&str>,
) -> Result<TlsAcceptor, RelayError> {
    let certs = load_certs(cert_file)?;
    let key = load_key(key_file)?;

    let builder = rustls::ServerConfig::builder();
    let config = match client_ca {
        Some(ca) => {
            let mut roots = rustls::RootCertStore::empty();
            for cert in load_certs(ca)? {
                roots.add(cert).map_err(|e| RelayError::Tls {
                    message: format!("bad client CA certificate in {ca}: {e}"),
                })?;
            }
            let verifier = rustls::server::WebPkiClientVerifier::builder(Arc::new(roots))
                .build()
                .map_err(|e| RelayError::Tls {
                    message: format!("client verifier setup failed: {e}"),
                })?;
            builder.with_client_cert_verifier(verifier)
        }
        None => builder.with_no_client_auth(),
    }
    .with_single_cert(certs, key)
    .map_err(|e| RelayError::Tls {
        message: format!("server certificate rejected: {e}"),
    })?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Resolves the SNI name for a destination host.
pub fn server_name(host: &str) -> Result<ServerName<'static>, RelayError> {
    ServerName::try_from(host.to_string()).map_err(|e| RelayError::Tls {
        message: format!("invalid server name '{host}': {e}"),
    })
}
