//! Fixed-size pool over a transport (component F). An HTTP node uses
//! `TunnelPool<TunnelClient>` with several members for load spreading; a
//! SOCKS5 node uses the same type with exactly one, per §9's unification
//! of the two historically-separate pool shapes.

use rand::Rng;

use super::transport::{BoxedDuplex, TunnelError, TunnelTransport};

pub struct TunnelPool<T: TunnelTransport> {
    members: Vec<T>,
}

impl<T: TunnelTransport> TunnelPool<T> {
    /// Builds a pool by running `connect` once per slot, in order. If any
    /// slot fails, every already-connected member is shut down and the
    /// error propagates — a pool is either fully up or not created at all.
    pub async fn build<F, Fut>(size: usize, mut connect: F) -> Result<Self, TunnelError>
    where
        F: FnMut(usize) -> Fut,
        Fut: std::future::Future<Output = Result<T, TunnelError>>,
    {
        let mut members = Vec::with_capacity(size);
        for i in 0..size {
            match connect(i).await {
                Ok(member) => members.push(member),
                Err(e) => {
                    for member in &members {
                        member.shutdown().await;
                    }
                    return Err(e);
                }
            }
        }
        Ok(Self { members })
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    fn pick(&self) -> &T {
        let idx = rand::thread_rng().gen_range(0..self.members.len());
        &self.members[idx]
    }
}

#[async_trait::async_trait]
impl<T: TunnelTransport> TunnelTransport for TunnelPool<T> {
    async fn dial(&self, network: &str, addr: &str) -> Result<BoxedDuplex, TunnelError> {
        if self.members.is_empty() {
            return Err(TunnelError::NotValid);
        }
        self.pick().dial(network, addr).await
    }

    async fn shutdown(&self) {
        for member in &self.members {
            member.shutdown().await;
        }
    }
}
