//! Worker -> control HTTP calls (spec.md §6 `/log`): "used by workers to
//! push textual diagnostic lines to control for aggregation" (supplemented
//! from `original_source/usbipicecl.py` / `webapp.py`, per `SPEC_FULL.md`).
//! Matches the teacher's `ureq`-based request helpers in
//! `apps/mtxchat/src/web.rs`.

use url::Url;

pub struct ControlClient {
    base_url: Url,
    worker_name: String,
}

impl ControlClient {
    pub fn new(base_url: &str, worker_name: impl Into<String>) -> Result<Self, url::ParseError> {
        Ok(ControlClient { base_url: Url::parse(base_url)?, worker_name: worker_name.into() })
    }

    /// Best-effort: a failed `/log` push is logged locally and otherwise
    /// ignored (spec.md §7 "Transient transport ... logged; ... surfaced as
    /// boolean failure").
    pub fn push_logs(&self, lines: Vec<String>) -> bool {
        let mut url = self.base_url.clone();
        url.set_path("/log");
        let body = serde_json::json!({ "name": self.worker_name, "logs": lines });
        match ureq::post(url.as_str()).send_json(body) {
            Ok(_) => true,
            Err(err) => {
                log::warn!(target: "icefarm_worker::control_client", "failed to push logs to control: {err}");
                false
            }
        }
    }
}
