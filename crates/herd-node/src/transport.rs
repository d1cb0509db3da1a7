//! The seams between a node controller and the outside world.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use herd_core::{
    AddObjectsRequest, CleanupRequest, FetchRequest, Hash, Image, PollRequest, PollResponse,
    SubConfiguration, UpdateRequest,
};

use crate::error::RpcResult;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// An authenticated connection to one sub.
pub trait SubClient: Send + Sync {
    fn poll(&self, request: PollRequest) -> BoxFuture<'_, RpcResult<PollResponse>>;

    fn fetch(&self, request: FetchRequest) -> BoxFuture<'_, RpcResult<()>>;

    fn update(&self, request: UpdateRequest) -> BoxFuture<'_, RpcResult<()>>;

    fn cleanup(&self, request: CleanupRequest) -> BoxFuture<'_, RpcResult<()>>;

    fn get_configuration(&self) -> BoxFuture<'_, RpcResult<SubConfiguration>>;

    fn set_configuration(&self, config: SubConfiguration) -> BoxFuture<'_, RpcResult<()>>;

    fn boost_cpu_limit(&self) -> BoxFuture<'_, RpcResult<()>>;

    fn boost_scan_limit(&self) -> BoxFuture<'_, RpcResult<()>>;

    /// Add objects to the sub's object server.
    fn add_objects(&self, request: AddObjectsRequest) -> BoxFuture<'_, RpcResult<()>>;

    fn is_encrypted(&self) -> bool {
        false
    }
}

/// Opens connections to subs.
pub trait SubConnector: Send + Sync {
    fn connect<'a>(&'a self, address: &'a str) -> BoxFuture<'a, RpcResult<Arc<dyn SubClient>>>;
}

/// Local source of object content, used to push computed files.
pub trait ObjectGetter: Send + Sync {
    fn get_object(&self, hash: Hash) -> BoxFuture<'_, Result<Vec<u8>, String>>;
}

/// Named images known to the herd.
pub trait ImageSource: Send + Sync {
    fn get(&self, name: &str) -> Option<Arc<Image>>;
}
