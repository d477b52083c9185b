//! Splitting a node operation into one request per owning gateway.

use std::collections::BTreeMap;
use std::io;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use wsn_common::{Action, Frame, GatewayNodeRequest};

use crate::store::{Store, StoreError};

/// Gateway that owns some of the requested nodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayTarget {
    pub gateway_id: String,
    pub ip: String,
    pub port: u16,
    /// Gateway-local ids of the nodes to act on.
    pub node_ids: Vec<String>,
}

/// Resolve node uids to their gateways. Unknown nodes and gateways without an
/// address are skipped.
pub fn targets(store: &Store, node_uids: &[String]) -> Result<Vec<GatewayTarget>, StoreError> {
    let mut by_gateway: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for uid in node_uids {
        match store.node(uid)? {
            Some(node) => by_gateway
                .entry(node.gateway_id)
                .or_default()
                .push(node.local_id),
            None => tracing::warn!(node = %uid, "Skipping unknown node"),
        }
    }

    let mut targets = Vec::with_capacity(by_gateway.len());
    for (gateway_id, node_ids) in by_gateway {
        match store.gateway_address(&gateway_id)? {
            Some((ip, port)) => targets.push(GatewayTarget {
                gateway_id,
                ip,
                port,
                node_ids,
            }),
            None => tracing::warn!(gateway = %gateway_id, "Skipping gateway without address"),
        }
    }
    Ok(targets)
}

/// Open a connection to the gateway and send it its share of the request.
pub async fn dispatch(
    target: &GatewayTarget,
    action: Action,
    image_name: Option<&str>,
) -> io::Result<TcpStream> {
    let request = GatewayNodeRequest {
        node_ids: target.node_ids.clone(),
        image_name: image_name.map(str::to_string),
    };
    let bytes = Frame::json(action, &request)
        .and_then(|frame| frame.encode())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

    let mut stream = TcpStream::connect((target.ip.as_str(), target.port)).await?;
    stream.write_all(&bytes).await?;
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    use crate::models::{GatewayRecord, NewNode};

    fn gateway(id: &str, port: u16) -> GatewayRecord {
        GatewayRecord {
            id: id.to_string(),
            ip: "127.0.0.1".to_string(),
            port,
            location: BTreeMap::new(),
        }
    }

    fn node(local_id: &str) -> NewNode {
        NewNode {
            local_id: local_id.to_string(),
            nodetype_id: "UNO".to_string(),
            location: BTreeMap::new(),
        }
    }

    #[test]
    fn test_targets_group_nodes_by_gateway() {
        let store = Store::open(":memory:").unwrap();
        let a = store
            .replace_gateway(&gateway("gw1", 7001), &[node("1"), node("2")])
            .unwrap();
        let b = store.replace_gateway(&gateway("gw2", 7002), &[node("1")]).unwrap();

        let uids = vec![
            a[0].uid.clone(),
            b[0].uid.clone(),
            a[1].uid.clone(),
            "missing".to_string(),
        ];
        let targets = targets(&store, &uids).unwrap();

        assert_eq!(targets.len(), 2);
        assert_eq!(targets[0].gateway_id, "gw1");
        assert_eq!(targets[0].port, 7001);
        assert_eq!(targets[0].node_ids, vec!["1", "2"]);
        assert_eq!(targets[1].gateway_id, "gw2");
        assert_eq!(targets[1].node_ids, vec!["1"]);
    }

    #[tokio::test]
    async fn test_dispatch_sends_gateway_request() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let target = GatewayTarget {
            gateway_id: "gw1".to_string(),
            ip: "127.0.0.1".to_string(),
            port,
            node_ids: vec!["3".to_string()],
        };

        let _stream = dispatch(&target, Action::NodesFlash, Some("blink.hex"))
            .await
            .unwrap();
        let (mut peer, _) = listener.accept().await.unwrap();
        let mut buf = vec![0u8; 256];
        let n = peer.read(&mut buf).await.unwrap();

        let frame = Frame::decode(&buf[..n]).unwrap();
        assert_eq!(frame.action(), Some(Action::NodesFlash));
        let request: GatewayNodeRequest = frame.parse().unwrap();
        assert_eq!(request.node_ids, vec!["3"]);
        assert_eq!(request.image_name.as_deref(), Some("blink.hex"));
    }
}
