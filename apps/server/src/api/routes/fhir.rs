//! FHIR API Routes
//!
//! Static segments (`_history`, `_search`, `$changes`, ...) take priority
//! over parameters at the same position. Path parameters are decoded as
//! UTF-8 and are case-sensitive.
//!
//! The compartment route shares its parameter names with the instance
//! routes: `/{compartment}/{id}/{type}` is registered as
//! `/:resource_type/:id/:target_type`.

use crate::api::handlers::{crud, history, operations, search};
use crate::state::AppState;
use axum::{
    routing::{get, post},
    Router,
};

pub fn fhir_routes() -> Router<AppState> {
    Router::new()
        // System level
        .route("/", get(search::search_system))
        .route("/_history", get(history::system_history))
        .route("/$changes", get(history::changes))
        .route("/$reindex", post(operations::reindex))
        // Type level
        .route(
            "/:resource_type",
            post(crud::create_resource).get(search::search_type),
        )
        .route("/:resource_type/_search", post(search::search_type_post))
        // Instance level
        .route(
            "/:resource_type/:id",
            get(crud::read_resource)
                .put(crud::update_resource)
                .delete(crud::delete_resource),
        )
        .route("/:resource_type/:id/_history", get(crud::resource_history))
        .route("/:resource_type/:id/_history/:vid", get(crud::vread_resource))
        .route("/:resource_type/:id/$erase", post(operations::erase))
        // Compartment search
        .route("/:resource_type/:id/:target_type", get(search::search_compartment))
}
