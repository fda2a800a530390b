//! 令牌来源。
//!
//! 客户端每次建立连接都需要一个未使用过的 [`TokenGrant`]，通常由业务后端的签发接口提供。

use crate::error::ClientError;
use common_models::TokenGrant;
use futures_util::future::BoxFuture;
use std::future::Future;

pub trait TokenProvider: Send + Sync {
    fn fetch(&self) -> BoxFuture<'_, Result<TokenGrant, ClientError>>;
}

/// 以闭包实现的令牌来源。
pub struct FnTokenProvider<F> {
    fetch: F,
}

impl<F, Fut> FnTokenProvider<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<TokenGrant, ClientError>> + Send + 'static,
{
    pub fn new(fetch: F) -> Self {
        Self { fetch }
    }
}

impl<F, Fut> TokenProvider for FnTokenProvider<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<TokenGrant, ClientError>> + Send + 'static,
{
    fn fetch(&self) -> BoxFuture<'_, Result<TokenGrant, ClientError>> {
        Box::pin((self.fetch)())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_fn_provider_calls_closure_each_time() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let provider = FnTokenProvider::new(move || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                Ok(TokenGrant {
                    token: format!("t{}", n),
                    signature: "s".into(),
                    nonce: format!("n{}", n),
                    expires_at: 0,
                })
            }
        });
        let first = provider.fetch().await.expect("获取令牌失败");
        let second = provider.fetch().await.expect("获取令牌失败");
        assert_ne!(first.nonce, second.nonce);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
