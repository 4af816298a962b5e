//! Wire types for the evaluator service.
//!
//! One unary RPC, `orchard.fn.FunctionEvaluator/Evaluate`, carried over
//! gRPC; health checking uses the standard `grpc.health.v1` service from
//! `tonic-health`. The message and service definitions are committed
//! in-tree in the shape `tonic`'s code generation produces, so builds do
//! not depend on a protobuf toolchain.

/// A request to evaluate one function over an envelope.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct EvaluateRequest {
    /// The function image to evaluate.
    #[prost(string, tag = "1")]
    pub image: ::prost::alloc::string::String,
    /// The bundle in envelope form.
    #[prost(bytes = "vec", tag = "2")]
    pub resource_list: ::prost::alloc::vec::Vec<u8>,
    /// Optional configuration document for the function; empty when unset.
    #[prost(bytes = "vec", tag = "3")]
    pub config: ::prost::alloc::vec::Vec<u8>,
}

/// The outcome of one evaluation.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct EvaluateResponse {
    /// The transformed envelope; empty when the function failed.
    #[prost(bytes = "vec", tag = "1")]
    pub resource_list: ::prost::alloc::vec::Vec<u8>,
    /// The function's stderr.
    #[prost(bytes = "vec", tag = "2")]
    pub log: ::prost::alloc::vec::Vec<u8>,
    /// Structured diagnostics; non-empty when the function failed.
    #[prost(message, repeated, tag = "3")]
    pub results: ::prost::alloc::vec::Vec<FunctionResult>,
}

/// One structured diagnostic reported by a function run.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FunctionResult {
    /// Human-readable diagnostic text.
    #[prost(string, tag = "1")]
    pub message: ::prost::alloc::string::String,
    /// The function's exit code.
    #[prost(int32, tag = "2")]
    pub exit_code: i32,
}

/// A connected evaluator client over a transport channel.
pub type EvaluatorClient =
    function_evaluator_client::FunctionEvaluatorClient<tonic::transport::Channel>;

/// Client for the evaluator service.
pub mod function_evaluator_client {
    #![allow(unused_variables, dead_code, missing_docs, clippy::wildcard_imports)]
    use tonic::codegen::http::Uri;
    use tonic::codegen::*;

    #[derive(Debug, Clone)]
    pub struct FunctionEvaluatorClient<T> {
        inner: tonic::client::Grpc<T>,
    }

    impl FunctionEvaluatorClient<tonic::transport::Channel> {
        /// Attempt to create a new client by connecting to a given endpoint.
        pub async fn connect<D>(dst: D) -> Result<Self, tonic::transport::Error>
        where
            D: TryInto<tonic::transport::Endpoint>,
            D::Error: Into<StdError>,
        {
            let conn = tonic::transport::Endpoint::new(dst)?.connect().await?;
            Ok(Self::new(conn))
        }
    }

    impl<T> FunctionEvaluatorClient<T>
    where
        T: tonic::client::GrpcService<tonic::body::BoxBody>,
        T::Error: Into<StdError>,
        T::ResponseBody: Body<Data = Bytes> + Send + 'static,
        <T::ResponseBody as Body>::Error: Into<StdError> + Send,
    {
        pub fn new(inner: T) -> Self {
            let inner = tonic::client::Grpc::new(inner);
            Self { inner }
        }

        pub fn with_origin(inner: T, origin: Uri) -> Self {
            let inner = tonic::client::Grpc::with_origin(inner, origin);
            Self { inner }
        }

        /// Compress requests with the given encoding.
        #[must_use]
        pub fn send_compressed(mut self, encoding: CompressionEncoding) -> Self {
            self.inner = self.inner.send_compressed(encoding);
            self
        }

        /// Enable decompressing responses.
        #[must_use]
        pub fn accept_compressed(mut self, encoding: CompressionEncoding) -> Self {
            self.inner = self.inner.accept_compressed(encoding);
            self
        }

        /// Limits the maximum size of a decoded message.
        #[must_use]
        pub fn max_decoding_message_size(mut self, limit: usize) -> Self {
            self.inner = self.inner.max_decoding_message_size(limit);
            self
        }

        /// Limits the maximum size of an encoded message.
        #[must_use]
        pub fn max_encoding_message_size(mut self, limit: usize) -> Self {
            self.inner = self.inner.max_encoding_message_size(limit);
            self
        }

        pub async fn evaluate(
            &mut self,
            request: impl tonic::IntoRequest<super::EvaluateRequest>,
        ) -> std::result::Result<tonic::Response<super::EvaluateResponse>, tonic::Status> {
            self.inner.ready().await.map_err(|e| {
                tonic::Status::unknown(format!("Service was not ready: {}", e.into()))
            })?;
            let codec = tonic::codec::ProstCodec::default();
            let path =
                http::uri::PathAndQuery::from_static("/orchard.fn.FunctionEvaluator/Evaluate");
            let mut req = request.into_request();
            req.extensions_mut()
                .insert(GrpcMethod::new("orchard.fn.FunctionEvaluator", "Evaluate"));
            self.inner.unary(req, path, codec).await
        }
    }
}

/// Server for the evaluator service.
pub mod function_evaluator_server {
    #![allow(unused_variables, dead_code, missing_docs, clippy::wildcard_imports)]
    use tonic::codegen::*;

    /// The trait an evaluator service implementation provides.
    #[async_trait]
    pub trait FunctionEvaluator: Send + Sync + 'static {
        /// Evaluates one function over an envelope.
        async fn evaluate(
            &self,
            request: tonic::Request<super::EvaluateRequest>,
        ) -> std::result::Result<tonic::Response<super::EvaluateResponse>, tonic::Status>;
    }

    #[derive(Debug)]
    pub struct FunctionEvaluatorServer<T> {
        inner: Arc<T>,
        accept_compression_encodings: EnabledCompressionEncodings,
        send_compression_encodings: EnabledCompressionEncodings,
        max_decoding_message_size: Option<usize>,
        max_encoding_message_size: Option<usize>,
    }

    impl<T> FunctionEvaluatorServer<T> {
        pub fn new(inner: T) -> Self {
            Self::from_arc(Arc::new(inner))
        }

        pub fn from_arc(inner: Arc<T>) -> Self {
            Self {
                inner,
                accept_compression_encodings: Default::default(),
                send_compression_encodings: Default::default(),
                max_decoding_message_size: None,
                max_encoding_message_size: None,
            }
        }

        /// Enable decompressing requests with the given encoding.
        #[must_use]
        pub fn accept_compressed(mut self, encoding: CompressionEncoding) -> Self {
            self.accept_compression_encodings.enable(encoding);
            self
        }

        /// Compress responses with the given encoding, if the client supports it.
        #[must_use]
        pub fn send_compressed(mut self, encoding: CompressionEncoding) -> Self {
            self.send_compression_encodings.enable(encoding);
            self
        }

        /// Limits the maximum size of a decoded message.
        #[must_use]
        pub fn max_decoding_message_size(mut self, limit: usize) -> Self {
            self.max_decoding_message_size = Some(limit);
            self
        }

        /// Limits the maximum size of an encoded message.
        #[must_use]
        pub fn max_encoding_message_size(mut self, limit: usize) -> Self {
            self.max_encoding_message_size = Some(limit);
            self
        }
    }

    impl<T, B> tonic::codegen::Service<http::Request<B>> for FunctionEvaluatorServer<T>
    where
        T: FunctionEvaluator,
        B: Body + Send + 'static,
        B::Error: Into<StdError> + Send + 'static,
    {
        type Response = http::Response<tonic::body::BoxBody>;
        type Error = std::convert::Infallible;
        type Future = BoxFuture<Self::Response, Self::Error>;

        fn poll_ready(
            &mut self,
            _cx: &mut Context<'_>,
        ) -> Poll<std::result::Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, req: http::Request<B>) -> Self::Future {
            match req.uri().path() {
                "/orchard.fn.FunctionEvaluator/Evaluate" => {
                    #[allow(non_camel_case_types)]
                    struct EvaluateSvc<T: FunctionEvaluator>(pub Arc<T>);
                    impl<T: FunctionEvaluator>
                        tonic::server::UnaryService<super::EvaluateRequest> for EvaluateSvc<T>
                    {
                        type Response = super::EvaluateResponse;
                        type Future = BoxFuture<tonic::Response<Self::Response>, tonic::Status>;
                        fn call(
                            &mut self,
                            request: tonic::Request<super::EvaluateRequest>,
                        ) -> Self::Future {
                            let inner = Arc::clone(&self.0);
                            let fut = async move {
                                <T as FunctionEvaluator>::evaluate(&inner, request).await
                            };
                            Box::pin(fut)
                        }
                    }
                    let accept_compression_encodings = self.accept_compression_encodings;
                    let send_compression_encodings = self.send_compression_encodings;
                    let max_decoding_message_size = self.max_decoding_message_size;
                    let max_encoding_message_size = self.max_encoding_message_size;
                    let inner = Arc::clone(&self.inner);
                    let fut = async move {
                        let method = EvaluateSvc(inner);
                        let codec = tonic::codec::ProstCodec::default();
                        let mut grpc = tonic::server::Grpc::new(codec)
                            .apply_compression_config(
                                accept_compression_encodings,
                                send_compression_encodings,
                            )
                            .apply_max_message_size_config(
                                max_decoding_message_size,
                                max_encoding_message_size,
                            );
                        let res = grpc.unary(method, req).await;
                        Ok(res)
                    };
                    Box::pin(fut)
                },
                _ => Box::pin(async move {
                    Ok(http::Response::builder()
                        .status(200)
                        .header("grpc-status", tonic::Code::Unimplemented as i32)
                        .header(
                            http::header::CONTENT_TYPE,
                            tonic::metadata::GRPC_CONTENT_TYPE,
                        )
                        .body(empty_body())
                        .unwrap())
                }),
            }
        }
    }

    impl<T> Clone for FunctionEvaluatorServer<T> {
        fn clone(&self) -> Self {
            let inner = self.inner.clone();
            Self {
                inner,
                accept_compression_encodings: self.accept_compression_encodings,
                send_compression_encodings: self.send_compression_encodings,
                max_decoding_message_size: self.max_decoding_message_size,
                max_encoding_message_size: self.max_encoding_message_size,
            }
        }
    }

    /// The fully qualified service name.
    pub const SERVICE_NAME: &str = "orchard.fn.FunctionEvaluator";

    impl<T> tonic::server::NamedService for FunctionEvaluatorServer<T> {
        const NAME: &'static str = SERVICE_NAME;
    }
}
