//! QoS programming layer: REST calls against the OVSDB/OpenFlow controller.
//!
//! [`QosManager`] owns the per-flow limit tables and the six idempotent REST
//! operations that program them onto a switch. It performs no locking of
//! its own; [`crate::concurrency::ThreadedQosManager`] wraps it with a
//! binary-semaphore discipline.

use std::collections::HashMap;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, error};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::flow::FlowId;

/// Current limit and fixed queue assignment for one flow.
#[derive(Clone, Copy, Debug)]
pub struct FlowLimitEntry {
    pub current_limit_bps: i64,
    pub queue_id: u32,
}

/// Selects which switch(es) a QoS REST call targets.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DpidTarget {
    All,
    Dpid(u64),
}

impl DpidTarget {
    /// The path segment used by `/qos/queue/{target}` and `/qos/rules/{target}`:
    /// either `"all"` or the 16-hex-digit zero-padded datapath id.
    fn path_segment(self) -> String {
        match self {
            DpidTarget::All => "all".to_string(),
            DpidTarget::Dpid(id) => format!("{:016x}", id),
        }
    }
}

#[derive(Serialize)]
struct QueueEntry {
    max_rate: String,
}

#[derive(Serialize)]
struct QueueBody {
    #[serde(rename = "type")]
    ty: &'static str,
    max_rate: String,
    queues: Vec<QueueEntry>,
}

#[derive(Serialize)]
struct RuleMatch<'a> {
    nw_dst: &'a str,
    nw_proto: &'static str,
    tp_dst: u16,
}

#[derive(Serialize)]
struct RuleActions {
    queue: u32,
}

#[derive(Serialize)]
struct RuleBody<'a> {
    #[serde(rename = "match")]
    match_: RuleMatch<'a>,
    actions: RuleActions,
}

#[derive(Serialize)]
struct DeleteRulesBody {
    qos_id: &'static str,
}

/// Owns the per-flow limit tables and issues the REST calls that program
/// switch queues and classification rules.
pub struct QosManager {
    client: reqwest::blocking::Client,
    controller_baseurl: String,
    ovsdb_addr: String,
    default_max_rate: i64,
    /// Declaration order; queue_id = index + 1.
    order: Vec<FlowId>,
    initial_limits: HashMap<FlowId, FlowLimitEntry>,
    current_limits: HashMap<FlowId, FlowLimitEntry>,
}

impl QosManager {
    pub fn new(config: &Config) -> Self {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(config.http_timeout_secs))
            .build()
            .expect("building the http client failed, which can only happen from an invalid TLS configuration");

        let order: Vec<FlowId> = config.flows.iter().map(|(id, _)| id.clone()).collect();
        let mut initial_limits = HashMap::new();
        // Queue 0 is reserved for unmatched traffic; declared flows start at 1.
        for (qnum, (id, rate)) in config.flows.iter().enumerate() {
            initial_limits.insert(
                id.clone(),
                FlowLimitEntry {
                    current_limit_bps: *rate,
                    queue_id: (qnum + 1) as u32,
                },
            );
        }
        let current_limits = initial_limits.clone();

        QosManager {
            client,
            controller_baseurl: config.controller_baseurl.clone(),
            ovsdb_addr: config.ovsdb_addr.clone(),
            default_max_rate: config.interface_max_rate,
            order,
            initial_limits,
            current_limits,
        }
    }

    pub fn declared_flows(&self) -> impl Iterator<Item = &FlowId> {
        self.order.iter()
    }

    pub fn get_current_limit(&self, flow: &FlowId) -> Result<i64> {
        self.current_limits
            .get(flow)
            .map(|e| e.current_limit_bps)
            .ok_or_else(|| Error::FlowNotFound(flow.key()))
    }

    pub fn get_initial_limit(&self, flow: &FlowId) -> Result<i64> {
        self.initial_limits
            .get(flow)
            .map(|e| e.current_limit_bps)
            .ok_or_else(|| Error::FlowNotFound(flow.key()))
    }

    pub fn queue_id(&self, flow: &FlowId) -> Result<u32> {
        self.initial_limits
            .get(flow)
            .map(|e| e.queue_id)
            .ok_or_else(|| Error::FlowNotFound(flow.key()))
    }

    /// Update the limit of `flow` to `newlimit`, unless it is closer than
    /// `limit_step` to the current value (unless `force`).
    ///
    /// Returns whether the limit was actually changed.
    pub fn update_limit(
        &mut self,
        flow: &FlowId,
        newlimit: i64,
        limit_step: i64,
        force: bool,
    ) -> Result<bool> {
        let entry = self
            .current_limits
            .get_mut(flow)
            .ok_or_else(|| Error::FlowNotFound(flow.key()))?;
        if (newlimit - entry.current_limit_bps).abs() > limit_step || force {
            entry.current_limit_bps = newlimit;
            debug!(%flow, newlimit, "flow limit updated");
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// `PUT {base}/v1.0/conf/switches/{dpid16}/ovsdb_addr`. Must be called
    /// once per switch before any other QoS operation.
    pub fn set_ovsdb_addr(&self, dpid: u64) -> Result<()> {
        let url = format!(
            "{}/v1.0/conf/switches/{:016x}/ovsdb_addr",
            self.controller_baseurl, dpid
        );
        let body = format!("\"{}\"", self.ovsdb_addr);
        let resp = self
            .client
            .put(&url)
            .header("Content-Type", "application/x-www-form-urlencoded")
            .body(body)
            .send()?;
        self.log_response(&url, resp).map(|_| ())
    }

    fn queue_body(&self) -> QueueBody {
        let mut by_queue: Vec<(u32, i64)> = self
            .order
            .iter()
            .map(|f| {
                let e = &self.current_limits[f];
                (e.queue_id, e.current_limit_bps)
            })
            .collect();
        by_queue.sort_by_key(|(qid, _)| *qid);

        let mut queues = vec![QueueEntry {
            max_rate: self.default_max_rate.to_string(),
        }];
        queues.extend(
            by_queue
                .into_iter()
                .map(|(_, limit)| QueueEntry {
                    max_rate: limit.to_string(),
                }),
        );

        QueueBody {
            ty: "linux-htb",
            max_rate: self.default_max_rate.to_string(),
            queues,
        }
    }

    /// `POST {base}/qos/queue/{target}`. Retries once, after 100ms, if the
    /// first attempt fails with a response body containing `ovs_bridge`
    /// (the set_ovsdb_addr-not-yet-landed race).
    pub fn set_queues(&self, target: DpidTarget) -> Result<()> {
        let url = format!(
            "{}/qos/queue/{}",
            self.controller_baseurl,
            target.path_segment()
        );
        let body = self.queue_body();

        let resp = self.client.post(&url).json(&body).send()?;
        let (ok, raw_body) = self.log_response(&url, resp)?;
        if !ok && raw_body.contains("ovs_bridge") {
            error!(
                dpid = %target.path_segment(),
                "queue setting failed, probably due to early trial; retrying once in 100ms"
            );
            std::thread::sleep(Duration::from_millis(100));
            let retry = self.client.post(&url).json(&body).send()?;
            let (retry_ok, _) = self.log_response(&url, retry)?;
            return if retry_ok {
                tracing::info!(
                    dpid = %target.path_segment(),
                    "queue setting has completed on {} successfully",
                    target.path_segment()
                );
                Ok(())
            } else {
                Err(Error::Transport {
                    url,
                    detail: "queue setting failed after retry".to_string(),
                })
            };
        }
        if ok {
            tracing::info!(
                dpid = %target.path_segment(),
                "queue setting has completed on {} successfully",
                target.path_segment()
            );
            Ok(())
        } else {
            Err(Error::Transport {
                url,
                detail: raw_body,
            })
        }
    }

    pub fn get_queues(&self, target: DpidTarget) -> Result<()> {
        let url = format!(
            "{}/qos/queue/{}",
            self.controller_baseurl,
            target.path_segment()
        );
        let resp = self.client.get(&url).send()?;
        self.log_response(&url, resp).map(|_| ())
    }

    pub fn delete_queues(&self, target: DpidTarget) -> Result<()> {
        let url = format!(
            "{}/qos/queue/{}",
            self.controller_baseurl,
            target.path_segment()
        );
        let resp = self.client.delete(&url).send()?;
        self.log_response(&url, resp).map(|_| ())
    }

    /// `POST {base}/qos/rules/{target}`, once per declared flow.
    pub fn set_rules(&self, target: DpidTarget) -> Result<()> {
        let url = format!(
            "{}/qos/rules/{}",
            self.controller_baseurl,
            target.path_segment()
        );
        for flow in &self.order {
            let queue_id = self.initial_limits[flow].queue_id;
            let body = RuleBody {
                match_: RuleMatch {
                    nw_dst: &flow.ipv4_dst,
                    nw_proto: "UDP",
                    tp_dst: flow.udp_dst,
                },
                actions: RuleActions { queue: queue_id },
            };
            let resp = self.client.post(&url).json(&body).send()?;
            self.log_response(&url, resp)?;
        }
        Ok(())
    }

    pub fn get_rules(&self, target: DpidTarget) -> Result<()> {
        let url = format!(
            "{}/qos/rules/{}",
            self.controller_baseurl,
            target.path_segment()
        );
        let resp = self.client.get(&url).send()?;
        self.log_response(&url, resp).map(|_| ())
    }

    pub fn delete_rules(&self, target: DpidTarget) -> Result<()> {
        let url = format!(
            "{}/qos/rules/{}",
            self.controller_baseurl,
            target.path_segment()
        );
        let resp = self
            .client
            .delete(&url)
            .json(&DeleteRulesBody { qos_id: "all" })
            .send()?;
        self.log_response(&url, resp).map(|_| ())
    }

    /// `DELETE {base}/stats/flowentry/clear/{dpid decimal}`. Used only at
    /// shutdown to purge flow entries so a subsequent restart starts from a
    /// clean slate. Unlike the rest of this table, the dpid here is decimal,
    /// not 16-hex zero-padded; an earlier variant of the upstream cleaner
    /// used 16-hex, but the current one uses decimal and this follows it.
    pub fn clear_flow_entries(&self, dpid: u64) -> Result<()> {
        let url = format!("{}/stats/flowentry/clear/{}", self.controller_baseurl, dpid);
        let resp = self.client.delete(&url).send()?;
        self.log_response(&url, resp).map(|_| ())
    }

    /// Pretty-print the response body as JSON if possible, falling back to
    /// raw text; logs at `error` if the response failed, `debug` otherwise.
    /// Returns `(is_ok, raw_body)` so callers that need to inspect the body
    /// (e.g. the `ovs_bridge` race check in `set_queues`) don't have to
    /// re-read the response themselves.
    fn log_response(&self, url: &str, resp: reqwest::blocking::Response) -> Result<(bool, String)> {
        let (ok, body) = self.classify(url, resp)?;
        let pretty = serde_json::from_str::<serde_json::Value>(&body)
            .ok()
            .and_then(|v| serde_json::to_string_pretty(&v).ok())
            .unwrap_or_else(|| body.clone());
        if ok {
            debug!(%url, body = %pretty, "qos request ok");
        } else {
            error!(%url, body = %pretty, "qos request failed");
        }
        Ok((ok, body))
    }

    /// Returns `(is_ok, body_text)`. A response is ok iff `status < 300` and
    /// its body does not contain the literal substring `failure`.
    fn classify(&self, url: &str, resp: reqwest::blocking::Response) -> Result<(bool, String)> {
        let status = resp.status();
        let body = resp.text().map_err(|e| Error::Transport {
            url: url.to_string(),
            detail: e.to_string(),
        })?;
        let ok = status.as_u16() < 300 && !body.contains("failure");
        Ok((ok, body))
    }
}
