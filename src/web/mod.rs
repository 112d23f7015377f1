//! HTTP surface (§6): the JSON REST API terminating at the authenticating-proxy
//! ingress. Every handler starts from a `RequestContext` (the verified identity the
//! proxy injected) and a `Catalog`/`JoinOperation`/`ApprovalOperation` built against
//! one consistent snapshot of the policy tree — this module is the only place those
//! pieces get wired to axum.

pub mod context;
pub mod health;
pub mod routes;

pub use routes::router;
