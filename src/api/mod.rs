//! The HTTP control surface.
//!
//! Handlers validate declarative cluster requests and persist them through
//! the cluster store; the controllers pick the changes up from the store's
//! watch. Handlers only ever write the spec (plus the manual-retry gate,
//! which spec mutations clear); the status belongs to the controllers.

use std::path::PathBuf;

use actix_web::web::{self, Data, Json, Path as UrlPath};
use actix_web::{delete, get, post, put, HttpResponse, Responder};
use prometheus::{Encoder, TextEncoder};
use tracing::error;

use crate::controller::State;
use crate::store::{Cluster, ClusterState, ClusterStatus, ClusterStore, StoreError};

pub mod model;

mod assets;

use model::{ClusterRequest, ClusterResponse};

/// Shared state for the HTTP handlers.
#[derive(Clone)]
pub struct ApiState {
    pub clusters: ClusterStore,
    pub assets_root_dir: PathBuf,
    pub supervisor: State,
}

/// Register every route of the control surface.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(index)
        .service(healthz)
        .service(metrics)
        .service(create_cluster)
        .service(get_clusters)
        .service(get_cluster)
        .service(update_cluster)
        .service(delete_cluster)
        .service(assets::kubeconfig)
        .service(assets::logs)
        .service(assets::assets);
}

#[get("/healthz")]
async fn healthz() -> impl Responder {
    HttpResponse::Ok().body("ok")
}

#[get("/metrics")]
async fn metrics(state: Data<ApiState>) -> impl Responder {
    let families = state.supervisor.metrics();
    let encoder = TextEncoder::new();
    let mut buffer = vec![];
    if let Err(e) = encoder.encode(&families, &mut buffer) {
        error!(error = %e, "could not encode metrics");
        return HttpResponse::InternalServerError().finish();
    }
    HttpResponse::Ok().body(buffer)
}

#[get("/")]
async fn index(state: Data<ApiState>) -> impl Responder {
    let diagnostics = state.supervisor.diagnostics().await;
    HttpResponse::Ok().json(&diagnostics)
}

#[post("/clusters")]
async fn create_cluster(state: Data<ApiState>, body: Json<ClusterRequest>) -> impl Responder {
    let req = body.into_inner();
    if let Err(errs) = model::validate_create(&req) {
        return HttpResponse::BadRequest().json(errs);
    }
    match state.clusters.get(&req.name) {
        Ok(Some(_)) => {
            return HttpResponse::Conflict().json(format!("cluster {} already exists", req.name))
        }
        Ok(None) => {}
        Err(e) => return store_error(e),
    }
    let Some(spec) = req.to_spec() else {
        return HttpResponse::BadRequest()
            .json(vec![format!("{} is not a valid desiredState", req.desired_state)]);
    };
    let cluster = Cluster {
        spec,
        status: ClusterStatus::default(),
    };
    if let Err(e) = state.clusters.put(&req.name, &cluster).await {
        return store_error(e);
    }
    HttpResponse::Accepted().json(ClusterResponse::from_cluster(&req.name, &cluster))
}

#[get("/clusters")]
async fn get_clusters(state: Data<ApiState>) -> impl Responder {
    match state.clusters.get_all() {
        Ok(clusters) => {
            let response: Vec<ClusterResponse> = clusters
                .iter()
                .map(|(name, cluster)| ClusterResponse::from_cluster(name, cluster))
                .collect();
            HttpResponse::Ok().json(response)
        }
        Err(e) => store_error(e),
    }
}

#[get("/clusters/{name}")]
async fn get_cluster(state: Data<ApiState>, name: UrlPath<String>) -> impl Responder {
    match state.clusters.get(&name) {
        Ok(Some(cluster)) => HttpResponse::Ok().json(ClusterResponse::from_cluster(&name, &cluster)),
        Ok(None) => cluster_not_found(),
        Err(e) => store_error(e),
    }
}

#[put("/clusters/{name}")]
async fn update_cluster(
    state: Data<ApiState>,
    name: UrlPath<String>,
    body: Json<ClusterRequest>,
) -> impl Responder {
    let name = name.into_inner();
    let req = body.into_inner();
    let mut cluster = match state.clusters.get(&name) {
        Ok(Some(cluster)) => cluster,
        Ok(None) => return cluster_not_found(),
        Err(e) => return store_error(e),
    };
    if let Err(errs) = model::validate_update(&name, &req, &cluster) {
        return HttpResponse::BadRequest().json(errs);
    }
    let Some(desired_state) = ClusterState::parse(&req.desired_state) else {
        return HttpResponse::BadRequest()
            .json(vec![format!("{} is not a valid desiredState", req.desired_state)]);
    };

    // The etcd count is immutable and the provider cannot change; node
    // counts, the desired state, and the declared secrets may.
    cluster.spec.desired_state = desired_state;
    cluster.spec.master_count = req.master_count as u32;
    cluster.spec.worker_count = req.worker_count as u32;
    cluster.spec.ingress_count = req.ingress_count as u32;
    if !req.provisioner.secrets.is_empty() {
        cluster.spec.provisioner.secrets = req.provisioner.secrets.clone();
    }
    // A spec mutation re-arms a cluster held behind the manual retry gate.
    cluster.status.waiting_for_manual_retry = false;

    if let Err(e) = state.clusters.put(&name, &cluster).await {
        return store_error(e);
    }
    HttpResponse::Accepted().json(ClusterResponse::from_cluster(&name, &cluster))
}

#[delete("/clusters/{name}")]
async fn delete_cluster(state: Data<ApiState>, name: UrlPath<String>) -> impl Responder {
    let name = name.into_inner();
    let mut cluster = match state.clusters.get(&name) {
        Ok(Some(cluster)) => cluster,
        Ok(None) => return cluster_not_found(),
        Err(e) => return store_error(e),
    };
    cluster.spec.desired_state = ClusterState::Destroyed;
    cluster.status.waiting_for_manual_retry = false;
    if let Err(e) = state.clusters.put(&name, &cluster).await {
        return store_error(e);
    }
    HttpResponse::Accepted().json("ok")
}

pub(crate) fn cluster_not_found() -> HttpResponse {
    HttpResponse::NotFound().json("cluster details not found in the store")
}

pub(crate) fn store_error(e: StoreError) -> HttpResponse {
    error!(error = %e, "store error while serving request");
    HttpResponse::InternalServerError().json(format!("could not access the cluster store: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{KvStore, CLUSTER_BUCKET};
    use actix_web::body::MessageBody;
    use actix_web::dev::{Service, ServiceResponse};
    use actix_web::http::StatusCode;
    use actix_web::{test, App};
    use serde_json::{json, Value};
    use std::sync::Arc;

    async fn test_state() -> (tempfile::TempDir, ApiState) {
        let dir = tempfile::tempdir().unwrap();
        let kv = Arc::new(KvStore::open(dir.path().join("store.db")).unwrap());
        kv.create_bucket(CLUSTER_BUCKET).unwrap();
        let clusters = ClusterStore::new(kv, CLUSTER_BUCKET);
        let state = ApiState {
            clusters,
            assets_root_dir: dir.path().join("clusters"),
            supervisor: State::default(),
        };
        (dir, state)
    }

    fn create_payload() -> Value {
        json!({
            "name": "c1",
            "desiredState": "installed",
            "etcdCount": 1,
            "masterCount": 1,
            "workerCount": 1,
            "ingressCount": 0,
            "provisioner": {
                "provider": "aws",
                "options": {"region": "us-east-1"},
                "secrets": {
                    "AWS_ACCESS_KEY_ID": "AKIA123",
                    "AWS_SECRET_ACCESS_KEY": "shhh"
                }
            }
        })
    }

    async fn body_json<B: MessageBody>(resp: ServiceResponse<B>) -> Value {
        let body = test::read_body(resp).await;
        serde_json::from_slice(&body).unwrap()
    }

    #[actix_web::test]
    async fn created_clusters_can_be_fetched_without_secrets() {
        let (_dir, state) = test_state().await;
        let app =
            test::init_service(App::new().app_data(Data::new(state.clone())).configure(configure))
                .await;

        let req = test::TestRequest::post()
            .uri("/clusters")
            .set_json(create_payload())
            .to_request();
        let resp = app.call(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);

        let req = test::TestRequest::get().uri("/clusters/c1").to_request();
        let resp = app.call(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_json_diff::assert_json_include!(
            actual: body.clone(),
            expected: json!({
                "name": "c1",
                "desiredState": "installed",
                "etcdCount": 1,
                "masterCount": 1,
                "workerCount": 1,
                "ingressCount": 0,
                "provisioner": {"provider": "aws", "options": {"region": "us-east-1"}}
            })
        );
        assert!(body["provisioner"].get("secrets").is_none());
        assert!(!body.to_string().contains("AKIA123"));

        // The record in the store keeps the secrets for the provisioner.
        let stored = state.clusters.get("c1").unwrap().unwrap();
        assert_eq!(
            stored.spec.provisioner.secrets.get("AWS_ACCESS_KEY_ID"),
            Some(&"AKIA123".to_string())
        );
    }

    #[actix_web::test]
    async fn invalid_create_requests_get_the_full_error_list() {
        let (_dir, state) = test_state().await;
        let app =
            test::init_service(App::new().app_data(Data::new(state)).configure(configure)).await;

        let mut payload = create_payload();
        payload["etcdCount"] = json!(0);
        let req = test::TestRequest::post()
            .uri("/clusters")
            .set_json(payload)
            .to_request();
        let resp = app.call(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let errs = body_json(resp).await;
        assert!(errs
            .as_array()
            .unwrap()
            .contains(&json!("cluster.etcdCount must be greater than 0")));
    }

    #[actix_web::test]
    async fn creating_the_same_cluster_twice_conflicts() {
        let (_dir, state) = test_state().await;
        let app =
            test::init_service(App::new().app_data(Data::new(state)).configure(configure)).await;

        let req = test::TestRequest::post()
            .uri("/clusters")
            .set_json(create_payload())
            .to_request();
        assert_eq!(app.call(req).await.unwrap().status(), StatusCode::ACCEPTED);

        let req = test::TestRequest::post()
            .uri("/clusters")
            .set_json(create_payload())
            .to_request();
        assert_eq!(app.call(req).await.unwrap().status(), StatusCode::CONFLICT);
    }

    #[actix_web::test]
    async fn getting_a_missing_cluster_is_a_404() {
        let (_dir, state) = test_state().await;
        let app =
            test::init_service(App::new().app_data(Data::new(state)).configure(configure)).await;

        let req = test::TestRequest::get().uri("/clusters/nope").to_request();
        assert_eq!(app.call(req).await.unwrap().status(), StatusCode::NOT_FOUND);
    }

    #[actix_web::test]
    async fn updates_cannot_change_the_etcd_count() {
        let (_dir, state) = test_state().await;
        let app =
            test::init_service(App::new().app_data(Data::new(state)).configure(configure)).await;

        let req = test::TestRequest::post()
            .uri("/clusters")
            .set_json(create_payload())
            .to_request();
        assert_eq!(app.call(req).await.unwrap().status(), StatusCode::ACCEPTED);

        let mut payload = create_payload();
        payload["etcdCount"] = json!(3);
        let req = test::TestRequest::put()
            .uri("/clusters/c1")
            .set_json(payload)
            .to_request();
        let resp = app.call(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let errs = body_json(resp).await;
        assert!(errs
            .as_array()
            .unwrap()
            .contains(&json!("cluster.etcdCount cannot be modified")));
    }

    #[actix_web::test]
    async fn updates_clear_the_manual_retry_gate() {
        let (_dir, state) = test_state().await;
        let app =
            test::init_service(App::new().app_data(Data::new(state.clone())).configure(configure))
                .await;

        let req = test::TestRequest::post()
            .uri("/clusters")
            .set_json(create_payload())
            .to_request();
        assert_eq!(app.call(req).await.unwrap().status(), StatusCode::ACCEPTED);

        // Simulate a controller that failed an action and gated itself.
        let mut stored = state.clusters.get("c1").unwrap().unwrap();
        stored.status.current_state = Some(ClusterState::InstallFailed);
        stored.status.waiting_for_manual_retry = true;
        state.clusters.put("c1", &stored).await.unwrap();

        let mut payload = create_payload();
        payload["workerCount"] = json!(3);
        let req = test::TestRequest::put()
            .uri("/clusters/c1")
            .set_json(payload)
            .to_request();
        let resp = app.call(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        let body = body_json(resp).await;
        assert_eq!(body["workerCount"], 3);
        assert_eq!(body["waitingForManualRetry"], false);

        let stored = state.clusters.get("c1").unwrap().unwrap();
        assert!(!stored.status.waiting_for_manual_retry);
        assert_eq!(stored.spec.worker_count, 3);
        // The status is otherwise untouched.
        assert_eq!(stored.status.current_state, Some(ClusterState::InstallFailed));
    }

    #[actix_web::test]
    async fn delete_marks_the_cluster_for_destruction() {
        let (_dir, state) = test_state().await;
        let app =
            test::init_service(App::new().app_data(Data::new(state.clone())).configure(configure))
                .await;

        let req = test::TestRequest::post()
            .uri("/clusters")
            .set_json(create_payload())
            .to_request();
        assert_eq!(app.call(req).await.unwrap().status(), StatusCode::ACCEPTED);

        let req = test::TestRequest::delete().uri("/clusters/c1").to_request();
        assert_eq!(app.call(req).await.unwrap().status(), StatusCode::ACCEPTED);

        let stored = state.clusters.get("c1").unwrap().unwrap();
        assert_eq!(stored.spec.desired_state, ClusterState::Destroyed);
        assert!(!stored.status.waiting_for_manual_retry);

        let req = test::TestRequest::delete().uri("/clusters/nope").to_request();
        assert_eq!(app.call(req).await.unwrap().status(), StatusCode::NOT_FOUND);
    }

    #[actix_web::test]
    async fn listing_returns_every_cluster_sanitized() {
        let (_dir, state) = test_state().await;
        let app =
            test::init_service(App::new().app_data(Data::new(state)).configure(configure)).await;

        for name in ["a", "b"] {
            let mut payload = create_payload();
            payload["name"] = json!(name);
            let req = test::TestRequest::post()
                .uri("/clusters")
                .set_json(payload)
                .to_request();
            assert_eq!(app.call(req).await.unwrap().status(), StatusCode::ACCEPTED);
        }

        let req = test::TestRequest::get().uri("/clusters").to_request();
        let resp = app.call(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        let list = body.as_array().unwrap();
        assert_eq!(list.len(), 2);
        assert!(!body.to_string().contains("secrets"));
    }

    #[actix_web::test]
    async fn healthz_reports_ok() {
        let (_dir, state) = test_state().await;
        let app =
            test::init_service(App::new().app_data(Data::new(state)).configure(configure)).await;

        let req = test::TestRequest::get().uri("/healthz").to_request();
        let resp = app.call(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = test::read_body(resp).await;
        assert_eq!(&body[..], b"ok");
    }

    #[actix_web::test]
    async fn kubeconfig_and_logs_are_served_from_the_assets_dir() {
        let (_dir, state) = test_state().await;
        let app =
            test::init_service(App::new().app_data(Data::new(state.clone())).configure(configure))
                .await;

        let req = test::TestRequest::post()
            .uri("/clusters")
            .set_json(create_payload())
            .to_request();
        assert_eq!(app.call(req).await.unwrap().status(), StatusCode::ACCEPTED);

        // No kubeconfig yet: the cluster exists but the file does not.
        let req = test::TestRequest::get()
            .uri("/clusters/c1/kubeconfig")
            .to_request();
        assert_eq!(
            app.call(req).await.unwrap().status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );

        let cluster_dir = state.assets_root_dir.join("c1");
        std::fs::create_dir_all(cluster_dir.join("assets")).unwrap();
        std::fs::write(cluster_dir.join("assets").join("kubeconfig"), b"apiVersion: v1").unwrap();
        std::fs::write(cluster_dir.join("kismatic.log"), b"started controller\n").unwrap();

        let req = test::TestRequest::get()
            .uri("/clusters/c1/kubeconfig")
            .to_request();
        let resp = app.call(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers().get(actix_web::http::header::CONTENT_DISPOSITION).unwrap(),
            "attachment; filename=config"
        );
        let body = test::read_body(resp).await;
        assert_eq!(&body[..], b"apiVersion: v1");

        let req = test::TestRequest::get().uri("/clusters/c1/logs").to_request();
        let resp = app.call(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let req = test::TestRequest::get()
            .uri("/clusters/c1/assets")
            .to_request();
        let resp = app.call(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers().get(actix_web::http::header::CONTENT_DISPOSITION).unwrap(),
            "attachment; filename=c1-assets.tar.gz"
        );

        // Artifacts of unknown clusters are a 404.
        let req = test::TestRequest::get()
            .uri("/clusters/nope/kubeconfig")
            .to_request();
        assert_eq!(app.call(req).await.unwrap().status(), StatusCode::NOT_FOUND);
    }
}
