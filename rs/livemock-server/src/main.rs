//! Publisher binary (§6): loads a directory of fragmented CMAF seed files,
//! builds the WARP-style catalog once at startup, and serves it plus every
//! derived variant and dynamic subtitle track over MoQ until killed.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use axum::Router;
use axum::extract::State;
use axum::http::Method;
use axum::response::IntoResponse;
use axum::routing::get;
use bytes::Bytes;
use clap::Parser;
use livemock::catalog::{build_catalog, subtitle_catalog_track};
use livemock::subtitle::{subtitle_init_segment, SubtitleCodec, SubtitleSource};
use livemock::transport::next_session_id;
use livemock::{cmaf, PublishSource};
use moq_native::{Server, ServerTlsConfig, ServerTlsInfo};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

mod config;
mod publish;
mod session;

use config::Config;
use publish::TrackPublisher;
use session::{Registry, Session};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let config = Config::parse();
	config.log.init();

	let asset = livemock::asset::load_asset(&config.assets, config.batch())
		.await
		.context("failed to load seed assets")?;

	let mut init_segments = HashMap::new();
	for track in asset.tracks() {
		init_segments.insert(track.name.clone(), cmaf::init_segment(track)?);
	}
	let mut catalog = build_catalog(&asset, |track| init_segments.get(&track.name).cloned().unwrap_or_default());

	let epoch = Instant::now();
	let epoch_ms = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64;

	let mut tracks: HashMap<String, Arc<TrackPublisher>> = HashMap::new();
	for track in asset.tracks() {
		let source: Arc<dyn PublishSource> = Arc::new(track.clone());
		tracks.insert(track.name.clone(), TrackPublisher::new(source, epoch, config.stale_threshold));
	}

	// Dynamic subtitle tracks have no backing seed file, so their catalog
	// entries (§6, S5) are built here instead of inside `build_catalog`.
	let subtitle_sources = config
		.wvtt_langs
		.iter()
		.map(|lang| SubtitleSource::new(SubtitleCodec::Wvtt, lang.clone(), epoch_ms))
		.chain(config.stpp_langs.iter().map(|lang| SubtitleSource::new(SubtitleCodec::Stpp, lang.clone(), epoch_ms)));

	for source in subtitle_sources {
		let init_segment = subtitle_init_segment(source.codec, &source.lang)?;
		catalog.tracks.push(subtitle_catalog_track(source.codec, &source.lang, &init_segment));

		let name = source.track_name();
		tracks.insert(name, TrackPublisher::new(Arc::new(source), epoch, config.stale_threshold));
	}

	let catalog_json = Bytes::from(serde_json::to_vec(&catalog)?);

	tracing::info!(tracks = tracks.len(), namespace = %config.namespace, "catalog built");

	let cancel = CancellationToken::new();
	for publisher in tracks.values() {
		tokio::spawn(publisher.clone().run(cancel.clone()));
	}

	let registry = Arc::new(Registry {
		namespace: config.namespace.clone(),
		catalog_json,
		tracks,
		epoch,
	});

	let fingerprint_addr = config.fingerprint_addr();
	if fingerprint_addr.is_some() {
		warn_if_cert_unsuitable(&config.server.tls);
	}
	let mut server = config.server.init()?;
	tracing::info!(addr = ?server.local_addr(), "listening");

	let fingerprint_fut: Pin<Box<dyn std::future::Future<Output = anyhow::Result<()>> + Send>> = match fingerprint_addr {
		Some(addr) => Box::pin(serve_fingerprint(addr, server.tls_info())),
		None => Box::pin(std::future::pending()),
	};

	let result = tokio::select! {
		res = accept(&mut server, registry) => res,
		res = fingerprint_fut => res,
	};
	cancel.cancel();
	result
}

/// Accepts sessions forever, spawning one [`Session`] per connection.
async fn accept(server: &mut Server, registry: Arc<Registry>) -> anyhow::Result<()> {
	while let Some(request) = server.accept().await {
		let id = next_session_id();
		let registry = registry.clone();
		tokio::spawn(async move {
			if let Err(err) = (Session { id, request, registry }).run().await {
				tracing::warn!(%err, "session ended with error");
			}
		});
	}
	Ok(())
}

/// Serves `/fingerprint` (§6): the server certificate's SHA-256 hex, with
/// CORS/OPTIONS support so a browser subscriber can fetch it directly to
/// trust a self-signed certificate over WebTransport.
async fn serve_fingerprint(addr: SocketAddr, tls_info: Arc<RwLock<ServerTlsInfo>>) -> anyhow::Result<()> {
	let app = Router::new()
		.route("/fingerprint", get(fingerprint_handler))
		.layer(CorsLayer::new().allow_origin(Any).allow_methods([Method::GET, Method::OPTIONS]))
		.with_state(tls_info);

	let listener = tokio::net::TcpListener::bind(addr)
		.await
		.with_context(|| format!("failed to bind fingerprint listener on {addr}"))?;
	tracing::info!(%addr, "serving /fingerprint");
	axum::serve(listener, app).await.context("fingerprint server failed")?;
	Ok(())
}

async fn fingerprint_handler(State(tls_info): State<Arc<RwLock<ServerTlsInfo>>>) -> impl IntoResponse {
	tls_info.read().unwrap().fingerprints.first().cloned().unwrap_or_default()
}

/// Logs (not fails) if the configured server certificate doesn't meet the
/// self-signed/ECDSA/short-validity profile the fingerprint endpoint assumes
/// a local-development certificate has (§6). A freshly generated (`tls-generate`)
/// certificate is trusted without inspection since `moq-native` always mints
/// those as short-lived self-signed ECDSA certs.
fn warn_if_cert_unsuitable(tls: &ServerTlsConfig) {
	if !tls.generate.is_empty() {
		return;
	}
	let Some(path) = tls.cert.first() else { return };

	let bytes = match std::fs::read(path) {
		Ok(bytes) => bytes,
		Err(err) => {
			tracing::warn!(%err, path = %path.display(), "failed to read server certificate for fingerprint endpoint checks");
			return;
		}
	};
	let der = match x509_parser::pem::parse_x509_pem(&bytes) {
		Ok((_, pem)) => pem.contents,
		Err(_) => bytes,
	};

	let parsed = match x509_parser::parse_x509_certificate(&der) {
		Ok((_, parsed)) => parsed,
		Err(err) => {
			tracing::warn!(%err, "failed to parse server certificate for fingerprint endpoint checks");
			return;
		}
	};

	if parsed.subject() != parsed.issuer() {
		tracing::warn!("server certificate is not self-signed; the fingerprint endpoint is meant for local development certs");
	}

	const ECDSA_SIGNATURE_OIDS: &[&str] = &[
		"1.2.840.10045.4.3.1",
		"1.2.840.10045.4.3.2",
		"1.2.840.10045.4.3.3",
		"1.2.840.10045.4.3.4",
	];
	let is_ecdsa = ECDSA_SIGNATURE_OIDS.contains(&parsed.signature_algorithm.oid().to_id_string().as_str());
	if !is_ecdsa {
		tracing::warn!("server certificate is not ECDSA; browsers may reject WebTransport certificate-hash trust");
	}

	match parsed.validity().time_to_expiration() {
		Some(remaining) if remaining.whole_days() > 14 => {
			tracing::warn!(days = remaining.whole_days(), "server certificate validity exceeds 14 days");
		}
		None => tracing::warn!("server certificate has already expired"),
		_ => {}
	}
}
