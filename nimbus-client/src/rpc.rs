use std::future::Future;
use std::pin::Pin;

use nimbus_common::{call_with_retries, GrpcClient, NimbusError};

use crate::client::Client;

/// Runs one control-plane RPC under the client's standard retry policy.
///
/// Authorization is re-applied on every attempt (a retried call may cross a
/// token refresh), matching the client's request interception order.
pub(crate) async fn call<T, Req, Resp>(
    client: &Client,
    grpc: &GrpcClient<T>,
    operation: &str,
    request: Req,
    invoke: impl Fn(
        &mut T,
        tonic::Request<Req>,
    ) -> Pin<Box<dyn Future<Output = Result<tonic::Response<Resp>, tonic::Status>> + Send + '_>>,
) -> Result<Resp, NimbusError>
where
    T: Clone,
    Req: Clone,
{
    call_with_retries(operation, client.retries(), None, || async {
        let req = client.authorize(tonic::Request::new(request.clone())).await?;
        grpc.call(|c| invoke(c, req))
            .await
            .map(tonic::Response::into_inner)
            .map_err(NimbusError::from)
    })
    .await
}
