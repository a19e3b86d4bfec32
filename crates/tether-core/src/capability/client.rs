//! Client adapter.

use crate::broker::{BrokerExt, Connection, CLOSE_METHOD};
use crate::error::{Result, TetherError};
use crate::resource::{ResourceId, ResourceReply};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

/// A connection to one remote capability.
///
/// Typed clients wrap this and forward each trait method through
/// [`call`](Self::call) or [`call_resource`](Self::call_resource).
#[derive(Clone, Debug)]
pub struct CapabilityClient {
    capability: &'static str,
    conn: Connection,
    ext: Option<BrokerExt>,
}

impl CapabilityClient {
    /// `ext` is only needed if the capability creates sub-resources.
    pub fn new(capability: &'static str, conn: Connection, ext: Option<BrokerExt>) -> Self {
        Self {
            capability,
            conn,
            ext,
        }
    }

    pub fn capability(&self) -> &'static str {
        self.capability
    }

    pub fn id(&self) -> ResourceId {
        self.conn.id()
    }

    /// Invoke a value method.
    pub async fn call<P, R>(&self, method: &str, params: &P) -> Result<R>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let params = serde_json::to_value(params)?;
        let reply = self.conn.invoke(method, params).await?;
        serde_json::from_value(reply).map_err(|e| TetherError::Protocol {
            message: format!(
                "{}.{} returned an unexpected shape: {}",
                self.capability, method, e
            ),
        })
    }

    /// Invoke a creating method, dial the returned resource and wrap it as a
    /// `child` capability client.
    pub async fn call_resource<P>(
        &self,
        method: &str,
        params: &P,
        child: &'static str,
    ) -> Result<CapabilityClient>
    where
        P: Serialize + ?Sized,
    {
        let ext = self.ext.as_ref().ok_or_else(|| TetherError::NoBroker {
            capability: self.capability.to_string(),
        })?;

        let reply: ResourceReply = self.call(method, params).await?;
        let conn = ext.dial(reply.resource_id).await?;
        debug!(
            "{} dialed {} at resource {}",
            ext.name(),
            child,
            reply.resource_id
        );
        Ok(CapabilityClient::new(child, conn, Some(ext.named(child))))
    }

    /// Ask the server to close the resource.
    ///
    /// Succeeds when the server has already torn the resource down, so
    /// closing twice is harmless.
    pub async fn close(&self) -> Result<()> {
        match self.conn.invoke(CLOSE_METHOD, Value::Null).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_close_race() => {
                debug!(
                    "{} at resource {} already closed: {}",
                    self.capability,
                    self.id(),
                    e
                );
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}
