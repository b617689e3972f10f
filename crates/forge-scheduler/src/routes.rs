use axum::{
    middleware,
    routing::{get, post},
    Router,
};

use forge_common::auth::auth_middleware;

use crate::handlers::{
    cancel_run, cluster_cost, cluster_status, complete_run, dataset_lineage, decommission_node,
    delete_dataset, event_stream, fail_run, get_dataset, get_model, get_node, get_run,
    get_run_metrics, launch_run, list_datasets, list_evals, list_events, list_models,
    list_nodes, list_runs, node_heartbeat, promote_model, record_eval, record_run_metrics,
    register_dataset, register_node, scan_dataset_pii, set_model_stage, whoami,
};
use crate::metrics::{healthz_handler, metrics_handler};
use crate::state::AppState;

pub fn app(st: AppState) -> Router {
    let protected_routes = Router::new()
        .route("/whoami", get(whoami))
        .route("/cluster/status", get(cluster_status))
        .route("/cluster/cost", get(cluster_cost))
        // Nodes
        .route("/nodes", get(list_nodes).post(register_node))
        .route("/nodes/:id", get(get_node).delete(decommission_node))
        .route("/nodes/:id/heartbeat", post(node_heartbeat))
        // Runs
        .route("/runs", get(list_runs))
        .route("/runs/launch", post(launch_run))
        .route("/runs/:id", get(get_run))
        .route("/runs/:id/cancel", post(cancel_run))
        .route("/runs/:id/complete", post(complete_run))
        .route("/runs/:id/fail", post(fail_run))
        .route(
            "/runs/:id/metrics",
            get(get_run_metrics).post(record_run_metrics),
        )
        // Datasets
        .route("/datasets", get(list_datasets))
        .route("/datasets/register", post(register_dataset))
        .route("/datasets/:id", get(get_dataset).delete(delete_dataset))
        .route("/datasets/:id/lineage", get(dataset_lineage))
        .route("/datasets/:id/scan-pii", post(scan_dataset_pii))
        // Models and evals
        .route("/models", get(list_models))
        .route("/models/promote", post(promote_model))
        .route("/models/:id", get(get_model))
        .route("/models/:id/stage", post(set_model_stage))
        .route("/evals", get(list_evals).post(record_eval))
        // Feed
        .route("/events", get(list_events))
        .route("/events/stream", get(event_stream))
        .layer(middleware::from_fn_with_state(
            st.clone(),
            auth_middleware::<AppState>,
        ))
        .with_state(st.clone());

    let api_routes = Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(st)
        .merge(protected_routes);

    Router::new().nest("/api", api_routes)
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use forge_common::auth::AuthConfig;
    use forge_scheduler::{Cluster, SchedulerConfig};

    use super::*;
    use crate::reconcile::admit_once;

    fn state_with(auth: AuthConfig) -> AppState {
        AppState::new(Cluster::new(SchedulerConfig::default()), auth)
    }

    async fn call(
        app: &Router,
        method: &str,
        uri: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(t) = token {
            builder = builder.header("authorization", format!("Bearer {t}"));
        }
        let req = match body {
            Some(v) => builder
                .header("content-type", "application/json")
                .body(Body::from(v.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    async fn register_dataset(app: &Router, token: Option<&str>, name: &str) -> String {
        let (status, ds) = call(
            app,
            "POST",
            "/api/datasets/register",
            token,
            Some(json!({"name": name, "source_path": format!("s3://data/{name}.jsonl")})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        ds["id"].as_str().unwrap().to_string()
    }

    /// One sample from the Prometheus text endpoint.
    async fn metric(app: &Router, name: &str) -> String {
        let resp = app
            .clone()
            .oneshot(Request::get("/api/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let body = String::from_utf8(bytes.to_vec()).unwrap();
        let prefix = format!("forge_scheduler_{name} ");
        body.lines()
            .find_map(|l| l.strip_prefix(prefix.as_str()))
            .unwrap_or_else(|| panic!("{name} missing from\n{body}"))
            .to_string()
    }

    fn launch_body(name: &str, dataset_id: &str, recipe: &str) -> Value {
        json!({
            "name": name,
            "base_model": "llama-3-8b",
            "dataset_id": dataset_id,
            "recipe": recipe,
            "num_gpus": 2,
        })
    }

    #[tokio::test]
    async fn healthz_is_public() {
        let app = app(state_with(AuthConfig::from_tokens(Some("t:admin"), 0)));
        let resp = app
            .oneshot(Request::get("/api/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn launch_admit_complete_promote() {
        let st = state_with(AuthConfig::disabled());
        let app = app(st.clone());

        let (status, node) = call(
            &app,
            "POST",
            "/api/nodes",
            None,
            Some(json!({"node_id": "node-01", "gpu_count": 8, "gpu_type": "A100-80GB"})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(node["health"], "healthy");
        let dataset_id = register_dataset(&app, None, "alpaca").await;

        let (status, run) = call(
            &app,
            "POST",
            "/api/runs/launch",
            None,
            Some(json!({
                "name": "sft-llama",
                "base_model": "llama-3-8b",
                "dataset_id": dataset_id,
                "recipe": "dpo",
                "num_gpus": 4,
                "config_overrides": {"beta": 0.2}
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(run["status"], "pending");
        assert_eq!(run["config"]["beta"], 0.2);
        let run_id = run["id"].as_str().unwrap().to_string();

        admit_once(&st).await;
        let (_, run) = call(&app, "GET", &format!("/api/runs/{run_id}"), None, None).await;
        assert_eq!(run["status"], "running");
        assert_eq!(run["assigned_node"], "node-01");

        let (status, _) = call(
            &app,
            "POST",
            &format!("/api/runs/{run_id}/metrics"),
            None,
            Some(json!([
                {"step": 2, "loss": 1.5, "learning_rate": 5e-5, "epoch": 0.2},
                {"step": 1, "loss": 2.0, "learning_rate": 5e-5, "epoch": 0.1}
            ])),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        let (_, series) = call(
            &app,
            "GET",
            &format!("/api/runs/{run_id}/metrics?last_n=1"),
            None,
            None,
        )
        .await;
        assert_eq!(series["metrics"].as_array().unwrap().len(), 1);
        assert_eq!(series["metrics"][0]["step"], 2);

        let (status, _) = call(
            &app,
            "POST",
            &format!("/api/runs/{run_id}/complete"),
            None,
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, model) = call(
            &app,
            "POST",
            "/api/models/promote",
            None,
            Some(json!({"run_id": run_id, "name": "assistant", "version": "v1"})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(model["stage"], "staging");
        assert_eq!(model["recipe"], "dpo");

        let (_, page) = call(&app, "GET", "/api/models?stage=staging", None, None).await;
        assert_eq!(page["total"], 1);

        let (_, events) = call(&app, "GET", "/api/events?since=0", None, None).await;
        let types: Vec<_> = events["events"]
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e["type"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(types.first().map(String::as_str), Some("node_registered"));
        assert_eq!(types.last().map(String::as_str), Some("model_promoted"));
    }

    #[tokio::test]
    async fn errors_map_to_status_codes() {
        let st = state_with(AuthConfig::disabled());
        let app = app(st.clone());

        let (status, body) = call(&app, "GET", "/api/runs/missing", None, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["code"], "run_not_found");
        assert!(body["error"]["request_id"]
            .as_str()
            .unwrap()
            .starts_with("req_"));

        let (status, _) = call(&app, "GET", "/api/runs?status=zombie", None, None).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

        let spec = json!({"node_id": "node-01", "gpu_count": 4});
        call(&app, "POST", "/api/nodes", None, Some(spec.clone())).await;
        let (status, body) = call(&app, "POST", "/api/nodes", None, Some(spec)).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"]["code"], "duplicate_node");

        let (status, _) = call(
            &app,
            "GET",
            "/api/cluster/cost?num_gpus=4&hours=-2",
            None,
            None,
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

        let (status, body) = call(
            &app,
            "POST",
            "/api/runs/launch",
            None,
            Some(launch_body("a", "missing", "lora_sft")),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["code"], "dataset_not_found");

        let dataset_id = register_dataset(&app, None, "alpaca").await;
        let run_id = {
            let mut c = st.cluster.lock().await;
            let run = c
                .submit_run(serde_json::from_value(json!({
                    "name": "a", "base_model": "m", "dataset_id": dataset_id
                }))
                .unwrap())
                .unwrap();
            c.admit(Instant::now());
            c.complete_run(&run.id).unwrap();
            run.id
        };
        let (status, body) = call(
            &app,
            "POST",
            &format!("/api/runs/{run_id}/cancel"),
            None,
            None,
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"]["code"], "invalid_transition");
    }

    #[tokio::test]
    async fn cost_endpoint_uses_configured_rates() {
        let app = app(state_with(AuthConfig::disabled()));
        let (status, body) = call(
            &app,
            "GET",
            "/api/cluster/cost?num_gpus=4&hours=8",
            None,
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["gpu_cost"], 80.0);
        assert_eq!(body["platform_overhead"], 12.0);
        assert_eq!(body["total"], 92.0);

        let (_, body) = call(
            &app,
            "GET",
            "/api/cluster/cost?num_gpus=4&hours=8&spot=true",
            None,
            None,
        )
        .await;
        assert_eq!(body["breakdown"]["rate_per_gpu_hour"], 1.0);
    }

    #[tokio::test]
    async fn roles_are_enforced() {
        let auth = AuthConfig::from_tokens(Some("v:viewer,o:operator,n:agent"), 0);
        let app = app(state_with(auth));

        let (status, _) = call(&app, "GET", "/api/cluster/status", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _) = call(&app, "GET", "/api/cluster/status", Some("v"), None).await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = call(
            &app,
            "POST",
            "/api/datasets/register",
            Some("v"),
            Some(json!({"name": "alpaca", "source_path": "s3://a"})),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        let dataset_id = register_dataset(&app, Some("o"), "alpaca").await;
        let launch = json!({"name": "a", "base_model": "m", "dataset_id": dataset_id});

        let (status, _) =
            call(&app, "POST", "/api/runs/launch", Some("v"), Some(launch.clone())).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, _) = call(&app, "POST", "/api/runs/launch", Some("o"), Some(launch)).await;
        assert_eq!(status, StatusCode::CREATED);

        let node = json!({"node_id": "node-01", "gpu_count": 8});
        let (status, _) = call(&app, "POST", "/api/nodes", Some("o"), Some(node.clone())).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        let (status, _) = call(&app, "POST", "/api/nodes", Some("n"), Some(node)).await;
        assert_eq!(status, StatusCode::CREATED);
    }

    #[tokio::test]
    async fn dataset_registry_endpoints() {
        let st = state_with(AuthConfig::disabled());
        let app = app(st.clone());

        let raw = register_dataset(&app, None, "raw-chat").await;
        let (status, body) = call(
            &app,
            "POST",
            "/api/datasets/register",
            None,
            Some(json!({"name": "raw-chat", "source_path": "s3://other"})),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"]["code"], "conflict");

        let (status, clean) = call(
            &app,
            "POST",
            "/api/datasets/register",
            None,
            Some(json!({
                "name": "clean-chat",
                "version": "2.0.0",
                "source_path": "s3://data/clean.jsonl",
                "tags": ["sft"],
                "parent_dataset_id": raw
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(clean["format"], "jsonl");
        let clean_id = clean["id"].as_str().unwrap().to_string();

        let (_, page) = call(&app, "GET", "/api/datasets?tag=sft", None, None).await;
        assert_eq!(page["total"], 1);
        assert_eq!(page["items"][0]["id"], clean_id.as_str());
        let (_, page) = call(&app, "GET", "/api/datasets?name=chat", None, None).await;
        assert_eq!(page["total"], 2);

        let (_, chain) = call(
            &app,
            "GET",
            &format!("/api/datasets/{clean_id}/lineage"),
            None,
            None,
        )
        .await;
        let names: Vec<_> = chain
            .as_array()
            .unwrap()
            .iter()
            .map(|d| d["name"].as_str().unwrap())
            .collect();
        assert_eq!(names, vec!["clean-chat", "raw-chat"]);

        let (status, scan) = call(
            &app,
            "POST",
            &format!("/api/datasets/{clean_id}/scan-pii"),
            None,
            Some(json!(["prompt", "Phone Number"])),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(scan["pii_risk"], true);
        assert_eq!(scan["flagged_fields"], json!(["Phone Number"]));

        let (status, _) = call(
            &app,
            "POST",
            "/api/runs/launch",
            None,
            Some(launch_body("sft", &clean_id, "lora_sft")),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let (status, body) = call(
            &app,
            "DELETE",
            &format!("/api/datasets/{clean_id}"),
            None,
            None,
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(body["error"]["message"]
            .as_str()
            .unwrap()
            .contains("referenced by 1 run(s)"));

        let (status, _) = call(&app, "DELETE", &format!("/api/datasets/{raw}"), None, None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, body) = call(&app, "GET", &format!("/api/datasets/{raw}"), None, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["code"], "dataset_not_found");
    }

    #[tokio::test]
    async fn list_runs_filters_by_recipe() {
        let app = app(state_with(AuthConfig::disabled()));
        let dataset_id = register_dataset(&app, None, "alpaca").await;
        for (name, recipe) in [("a", "lora_sft"), ("b", "dpo"), ("c", "dpo")] {
            let (status, _) = call(
                &app,
                "POST",
                "/api/runs/launch",
                None,
                Some(launch_body(name, &dataset_id, recipe)),
            )
            .await;
            assert_eq!(status, StatusCode::CREATED);
        }

        let (_, page) = call(&app, "GET", "/api/runs?recipe=dpo", None, None).await;
        assert_eq!(page["total"], 2);
        assert!(page["items"]
            .as_array()
            .unwrap()
            .iter()
            .all(|r| r["recipe"] == "dpo"));

        let (_, page) = call(&app, "GET", "/api/runs?recipe=lora_sft&status=pending", None, None).await;
        assert_eq!(page["total"], 1);
        assert_eq!(page["items"][0]["name"], "a");

        let (status, body) = call(&app, "GET", "/api/runs?recipe=ppo", None, None).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["error"]["code"], "invalid_request");
    }

    #[tokio::test]
    async fn failure_and_heartbeat_outcomes_are_counted() {
        let st = state_with(AuthConfig::disabled());
        let app = app(st.clone());
        call(
            &app,
            "POST",
            "/api/nodes",
            None,
            Some(json!({"node_id": "node-01", "gpu_count": 8})),
        )
        .await;
        let dataset_id = register_dataset(&app, None, "alpaca").await;
        let mut body = launch_body("flaky", &dataset_id, "lora_sft");
        body["max_retries"] = json!(1);
        let (_, run) = call(&app, "POST", "/api/runs/launch", None, Some(body)).await;
        let run_id = run["id"].as_str().unwrap().to_string();

        for expected in ["pending", "failed"] {
            admit_once(&st).await;
            let (status, run) = call(
                &app,
                "POST",
                &format!("/api/runs/{run_id}/fail"),
                None,
                Some(json!({"reason": "oom"})),
            )
            .await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(run["status"], expected);
        }
        assert_eq!(metric(&app, "runs_requeued_total").await, "1");
        assert_eq!(metric(&app, "runs_failed_total").await, "1");
        assert_eq!(metric(&app, "nodes_offline_total").await, "0");

        for _ in 0..3 {
            let (status, _) = call(
                &app,
                "POST",
                "/api/nodes/node-01/heartbeat",
                None,
                Some(json!({"healthy": false})),
            )
            .await;
            assert_eq!(status, StatusCode::OK);
        }
        assert_eq!(metric(&app, "nodes_offline_total").await, "1");
        assert_eq!(metric(&app, "nodes_offline").await, "1");
        assert_eq!(metric(&app, "burn_rate_per_hour").await, "0");
    }
}
