//! Endpoints serving per-cluster artifacts: the kubeconfig, the controller
//! log, and an archive of the whole assets directory.

use std::path::Path;

use actix_web::http::header;
use actix_web::web::{Data, Path as UrlPath};
use actix_web::{get, HttpResponse, Responder};
use flate2::write::GzEncoder;
use flate2::Compression;
use tracing::error;

use crate::plan::{ASSETS_SUBDIR, LOG_FILENAME};

use super::{cluster_not_found, store_error, ApiState};

#[get("/clusters/{name}/kubeconfig")]
pub async fn kubeconfig(state: Data<ApiState>, name: UrlPath<String>) -> impl Responder {
    let name = name.into_inner();
    match state.clusters.get(&name) {
        Ok(Some(_)) => {}
        Ok(None) => return cluster_not_found(),
        Err(e) => return store_error(e),
    }
    let path = state
        .assets_root_dir
        .join(&name)
        .join(ASSETS_SUBDIR)
        .join("kubeconfig");
    match tokio::fs::read(&path).await {
        Ok(contents) => HttpResponse::Ok()
            .insert_header((header::CONTENT_DISPOSITION, "attachment; filename=config"))
            .content_type("application/octet-stream")
            .body(contents),
        Err(e) => {
            error!(cluster = %name, error = %e, "could not read kubeconfig");
            HttpResponse::InternalServerError()
                .json(format!("could not read the cluster kubeconfig: {e}"))
        }
    }
}

#[get("/clusters/{name}/logs")]
pub async fn logs(state: Data<ApiState>, name: UrlPath<String>) -> impl Responder {
    let name = name.into_inner();
    match state.clusters.get(&name) {
        Ok(Some(_)) => {}
        Ok(None) => return cluster_not_found(),
        Err(e) => return store_error(e),
    }
    let path = state.assets_root_dir.join(&name).join(LOG_FILENAME);
    match tokio::fs::read_to_string(&path).await {
        Ok(contents) => HttpResponse::Ok().content_type("text/plain").body(contents),
        Err(e) => {
            error!(cluster = %name, error = %e, "could not read cluster log");
            HttpResponse::InternalServerError().json(format!("could not read the cluster log: {e}"))
        }
    }
}

#[get("/clusters/{name}/assets")]
pub async fn assets(state: Data<ApiState>, name: UrlPath<String>) -> impl Responder {
    let name = name.into_inner();
    match state.clusters.get(&name) {
        Ok(Some(_)) => {}
        Ok(None) => return cluster_not_found(),
        Err(e) => return store_error(e),
    }
    let dir = state.assets_root_dir.join(&name);
    let archive_root = name.clone();
    let archive = actix_web::web::block(move || build_archive(&archive_root, &dir)).await;
    match archive {
        Ok(Ok(contents)) => HttpResponse::Ok()
            .insert_header((
                header::CONTENT_DISPOSITION,
                format!("attachment; filename={name}-assets.tar.gz"),
            ))
            .content_type("application/gzip")
            .body(contents),
        Ok(Err(e)) => {
            error!(cluster = %name, error = %e, "could not archive cluster assets");
            HttpResponse::InternalServerError()
                .json(format!("could not archive the cluster assets: {e}"))
        }
        Err(e) => {
            error!(cluster = %name, error = %e, "archiving task failed");
            HttpResponse::InternalServerError()
                .json("could not archive the cluster assets".to_string())
        }
    }
}

fn build_archive(root: &str, dir: &Path) -> std::io::Result<Vec<u8>> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.append_dir_all(root, dir)?;
    let encoder = builder.into_inner()?;
    encoder.finish()
}
