//! Turns a `grpc+<scheme>://...` URL into a lazily-connecting
//! [tonic::transport::Channel], used by [crate::backend::GrpcBackend] and
//! by the daemon's management client. Same `grpc+unix:`/`grpc+http(s):`
//! scheme convention a gRPC-fronted store client typically exposes,
//! folded into this crate's single [crate::Error] type instead of a
//! dedicated local error enum.

use tokio::net::UnixStream;
use tonic::transport::{Channel, Endpoint};

use crate::{Error, Result};

/// Connects lazily: the URL is parsed and validated eagerly, but the
/// actual TCP/unix-socket connection isn't attempted until the first RPC
/// goes out, matching tonic's `connect_lazy` behavior.
pub fn from_url(url: &url::Url) -> Result<Channel> {
    let rest = url
        .scheme()
        .strip_prefix("grpc+")
        .ok_or_else(|| Error::Argument(format!("missing grpc+ prefix in {url}")))?;

    if rest == "unix" {
        if url.host_str().is_some() {
            return Err(Error::Argument("host may not be set for a unix-domain grpc+unix URL".into()));
        }
        let url = url.clone();
        Ok(Endpoint::from_static("http://[::]:50051") // placeholder authority, unused by the connector below
            .connect_with_connector_lazy(tower::service_fn(move |_: tonic::transport::Uri| {
                UnixStream::connect(url.path().to_string())
            })))
    } else {
        if !url.path().is_empty() {
            return Err(Error::Argument("path may not be set on a non-unix grpc URL".into()));
        }
        let stripped = url.to_string();
        let stripped = stripped.strip_prefix("grpc+").expect("checked above").to_owned();
        Ok(Endpoint::try_from(stripped)?.connect_lazy())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_url_without_grpc_prefix() {
        let url = url::Url::parse("http://localhost:8000").unwrap();
        let err = from_url(&url).unwrap_err();
        assert!(matches!(err, Error::Argument(_)));
    }

    #[test]
    fn rejects_host_on_unix_scheme() {
        let url = url::Url::parse("grpc+unix://somehost/path/to.sock").unwrap();
        let err = from_url(&url).unwrap_err();
        assert!(matches!(err, Error::Argument(_)));
    }

    #[test]
    fn accepts_http_url() {
        let url = url::Url::parse("grpc+http://[::1]:8000").unwrap();
        assert!(from_url(&url).is_ok());
    }

    #[test]
    fn accepts_unix_url() {
        let url = url::Url::parse("grpc+unix:///var/run/vfsd.sock").unwrap();
        assert!(from_url(&url).is_ok());
    }
}
