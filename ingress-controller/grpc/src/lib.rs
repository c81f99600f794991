//! Envoy discovery services
//!
//! A single [`DiscoveryServer`] implements the aggregated discovery service
//! and the per-family cluster, endpoint, listener, route and secret discovery
//! services. Every state-of-the-world stream shares one implementation, which
//! serves resources from the [`Caches`] and pushes each newly published
//! snapshot to subscribed clients.

#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod metrics;
mod stream;

use self::{metrics::DiscoveryMetrics, stream::BoxDiscoveryStream};
use envoy_types::pb::envoy::service::{
    cluster::v3::cluster_discovery_service_server::{
        ClusterDiscoveryService, ClusterDiscoveryServiceServer,
    },
    discovery::v3::{
        aggregated_discovery_service_server::{
            AggregatedDiscoveryService, AggregatedDiscoveryServiceServer,
        },
        DeltaDiscoveryRequest, DeltaDiscoveryResponse, DiscoveryRequest, DiscoveryResponse,
    },
    endpoint::v3::endpoint_discovery_service_server::{
        EndpointDiscoveryService, EndpointDiscoveryServiceServer,
    },
    listener::v3::listener_discovery_service_server::{
        ListenerDiscoveryService, ListenerDiscoveryServiceServer,
    },
    route::v3::route_discovery_service_server::{
        RouteDiscoveryService, RouteDiscoveryServiceServer,
    },
    secret::v3::secret_discovery_service_server::{
        SecretDiscoveryService, SecretDiscoveryServiceServer,
    },
};
use futures::prelude::*;
use ingress_controller_xds::{
    Caches, CLUSTER_TYPE_URL, ENDPOINT_TYPE_URL, LISTENER_TYPE_URL, ROUTE_TYPE_URL,
    SECRET_TYPE_URL,
};
use std::pin::Pin;
use tonic::{Request, Response, Status, Streaming};

type BoxDeltaStream = Pin<Box<dyn Stream<Item = Result<DeltaDiscoveryResponse, Status>> + Send>>;

const ADS: &str = "envoy.service.discovery.v3.AggregatedDiscoveryService";
const CDS: &str = "envoy.service.cluster.v3.ClusterDiscoveryService";
const EDS: &str = "envoy.service.endpoint.v3.EndpointDiscoveryService";
const LDS: &str = "envoy.service.listener.v3.ListenerDiscoveryService";
const RDS: &str = "envoy.service.route.v3.RouteDiscoveryService";
const SDS: &str = "envoy.service.secret.v3.SecretDiscoveryService";

#[derive(Clone, Debug)]
pub struct DiscoveryServer {
    caches: Caches,
    metrics: DiscoveryMetrics,
    drain: drain::Watch,
}

// === impl DiscoveryServer ===

impl DiscoveryServer {
    pub fn new(caches: Caches, metrics: DiscoveryMetrics, drain: drain::Watch) -> Self {
        Self {
            caches,
            metrics,
            drain,
        }
    }

    pub fn aggregated_svc(self) -> AggregatedDiscoveryServiceServer<Self> {
        AggregatedDiscoveryServiceServer::new(self)
    }

    pub fn cluster_svc(self) -> ClusterDiscoveryServiceServer<Self> {
        ClusterDiscoveryServiceServer::new(self)
    }

    pub fn endpoint_svc(self) -> EndpointDiscoveryServiceServer<Self> {
        EndpointDiscoveryServiceServer::new(self)
    }

    pub fn listener_svc(self) -> ListenerDiscoveryServiceServer<Self> {
        ListenerDiscoveryServiceServer::new(self)
    }

    pub fn route_svc(self) -> RouteDiscoveryServiceServer<Self> {
        RouteDiscoveryServiceServer::new(self)
    }

    pub fn secret_svc(self) -> SecretDiscoveryServiceServer<Self> {
        SecretDiscoveryServiceServer::new(self)
    }

    fn stream(
        &self,
        svc: &'static str,
        method: &'static str,
        family: Option<&'static str>,
        req: Request<Streaming<DiscoveryRequest>>,
    ) -> Result<Response<BoxDiscoveryStream>, Status> {
        tracing::debug!(client.addr = ?req.remote_addr(), svc, "Discovery stream started");
        let observer = self.metrics.rpc(svc, method);
        Ok(Response::new(stream::discovery_stream(
            self.caches.clone(),
            family,
            req.into_inner(),
            self.drain.clone(),
            observer,
        )))
    }

    fn fetch(
        &self,
        svc: &'static str,
        method: &'static str,
        family: &'static str,
        req: Request<DiscoveryRequest>,
    ) -> Result<Response<DiscoveryResponse>, Status> {
        let mut observer = self.metrics.rpc(svc, method);
        observer.request_received();
        match stream::fetch(&self.caches, Some(family), req.get_ref()) {
            Ok(rsp) => {
                observer.response_sent();
                Ok(Response::new(rsp))
            }
            Err(status) => {
                observer.finish(status.code());
                Err(status)
            }
        }
    }

    fn delta(
        &self,
        svc: &'static str,
        method: &'static str,
    ) -> Result<Response<BoxDeltaStream>, Status> {
        self.metrics
            .rpc(svc, method)
            .finish(tonic::Code::Unimplemented);
        Err(Status::unimplemented("incremental discovery is not supported"))
    }
}

#[async_trait::async_trait]
impl AggregatedDiscoveryService for DiscoveryServer {
    type StreamAggregatedResourcesStream = BoxDiscoveryStream;

    async fn stream_aggregated_resources(
        &self,
        req: Request<Streaming<DiscoveryRequest>>,
    ) -> Result<Response<BoxDiscoveryStream>, Status> {
        self.stream(ADS, "StreamAggregatedResources", None, req)
    }

    type DeltaAggregatedResourcesStream = BoxDeltaStream;

    async fn delta_aggregated_resources(
        &self,
        _req: Request<Streaming<DeltaDiscoveryRequest>>,
    ) -> Result<Response<BoxDeltaStream>, Status> {
        self.delta(ADS, "DeltaAggregatedResources")
    }
}

#[async_trait::async_trait]
impl ClusterDiscoveryService for DiscoveryServer {
    type StreamClustersStream = BoxDiscoveryStream;

    async fn stream_clusters(
        &self,
        req: Request<Streaming<DiscoveryRequest>>,
    ) -> Result<Response<BoxDiscoveryStream>, Status> {
        self.stream(CDS, "StreamClusters", Some(CLUSTER_TYPE_URL), req)
    }

    type DeltaClustersStream = BoxDeltaStream;

    async fn delta_clusters(
        &self,
        _req: Request<Streaming<DeltaDiscoveryRequest>>,
    ) -> Result<Response<BoxDeltaStream>, Status> {
        self.delta(CDS, "DeltaClusters")
    }

    async fn fetch_clusters(
        &self,
        req: Request<DiscoveryRequest>,
    ) -> Result<Response<DiscoveryResponse>, Status> {
        self.fetch(CDS, "FetchClusters", CLUSTER_TYPE_URL, req)
    }
}

#[async_trait::async_trait]
impl EndpointDiscoveryService for DiscoveryServer {
    type StreamEndpointsStream = BoxDiscoveryStream;

    async fn stream_endpoints(
        &self,
        req: Request<Streaming<DiscoveryRequest>>,
    ) -> Result<Response<BoxDiscoveryStream>, Status> {
        self.stream(EDS, "StreamEndpoints", Some(ENDPOINT_TYPE_URL), req)
    }

    type DeltaEndpointsStream = BoxDeltaStream;

    async fn delta_endpoints(
        &self,
        _req: Request<Streaming<DeltaDiscoveryRequest>>,
    ) -> Result<Response<BoxDeltaStream>, Status> {
        self.delta(EDS, "DeltaEndpoints")
    }

    async fn fetch_endpoints(
        &self,
        req: Request<DiscoveryRequest>,
    ) -> Result<Response<DiscoveryResponse>, Status> {
        self.fetch(EDS, "FetchEndpoints", ENDPOINT_TYPE_URL, req)
    }
}

#[async_trait::async_trait]
impl ListenerDiscoveryService for DiscoveryServer {
    type StreamListenersStream = BoxDiscoveryStream;

    async fn stream_listeners(
        &self,
        req: Request<Streaming<DiscoveryRequest>>,
    ) -> Result<Response<BoxDiscoveryStream>, Status> {
        self.stream(LDS, "StreamListeners", Some(LISTENER_TYPE_URL), req)
    }

    type DeltaListenersStream = BoxDeltaStream;

    async fn delta_listeners(
        &self,
        _req: Request<Streaming<DeltaDiscoveryRequest>>,
    ) -> Result<Response<BoxDeltaStream>, Status> {
        self.delta(LDS, "DeltaListeners")
    }

    async fn fetch_listeners(
        &self,
        req: Request<DiscoveryRequest>,
    ) -> Result<Response<DiscoveryResponse>, Status> {
        self.fetch(LDS, "FetchListeners", LISTENER_TYPE_URL, req)
    }
}

#[async_trait::async_trait]
impl RouteDiscoveryService for DiscoveryServer {
    type StreamRoutesStream = BoxDiscoveryStream;

    async fn stream_routes(
        &self,
        req: Request<Streaming<DiscoveryRequest>>,
    ) -> Result<Response<BoxDiscoveryStream>, Status> {
        self.stream(RDS, "StreamRoutes", Some(ROUTE_TYPE_URL), req)
    }

    type DeltaRoutesStream = BoxDeltaStream;

    async fn delta_routes(
        &self,
        _req: Request<Streaming<DeltaDiscoveryRequest>>,
    ) -> Result<Response<BoxDeltaStream>, Status> {
        self.delta(RDS, "DeltaRoutes")
    }

    async fn fetch_routes(
        &self,
        req: Request<DiscoveryRequest>,
    ) -> Result<Response<DiscoveryResponse>, Status> {
        self.fetch(RDS, "FetchRoutes", ROUTE_TYPE_URL, req)
    }
}

#[async_trait::async_trait]
impl SecretDiscoveryService for DiscoveryServer {
    type StreamSecretsStream = BoxDiscoveryStream;

    async fn stream_secrets(
        &self,
        req: Request<Streaming<DiscoveryRequest>>,
    ) -> Result<Response<BoxDiscoveryStream>, Status> {
        self.stream(SDS, "StreamSecrets", Some(SECRET_TYPE_URL), req)
    }

    type DeltaSecretsStream = BoxDeltaStream;

    async fn delta_secrets(
        &self,
        _req: Request<Streaming<DeltaDiscoveryRequest>>,
    ) -> Result<Response<BoxDeltaStream>, Status> {
        self.delta(SDS, "DeltaSecrets")
    }

    async fn fetch_secrets(
        &self,
        req: Request<DiscoveryRequest>,
    ) -> Result<Response<DiscoveryResponse>, Status> {
        self.fetch(SDS, "FetchSecrets", SECRET_TYPE_URL, req)
    }
}
