//! OpenAPI documentation configuration
//!
//! Generates the OpenAPI 3.0 document served under `/docs`.

use utoipa::OpenApi;

use crate::handlers::{
    DeleteResponse, EnrollResponse, ExtractResponse, HealthResponse, ListIdentitiesResponse,
    ReadyResponse, VerifyResponse,
};

/// FaceID API - OpenAPI Documentation
#[derive(OpenApi)]
#[openapi(
    info(
        title = "FaceID - Identity Matching API",
        version = "0.1.0",
        description = r#"
## Face enrollment and verification

Every request carries one face image, either uploaded as the `image` file
field or referenced by an `image_url` text field.

1. **Enroll** a face under an identity label via `POST /enroll`
2. **Verify** a new image via `POST /verify`; the best-matching identity is
   returned when its similarity reaches the threshold
3. **Delete** an identity via `DELETE /identities/{label}`

Images with no face or with several faces are rejected with `422`.

Errors are JSON objects `{"error": "...", "code": "..."}`.
"#,
        license(name = "MIT OR Apache-2.0")
    ),
    servers(
        (url = "http://localhost:8000", description = "Local development server")
    ),
    tags(
        (name = "Enrollment", description = "Bind a face fingerprint to an identity label"),
        (name = "Verification", description = "Match a face against enrolled identities"),
        (name = "Identities", description = "List and delete enrolled identities"),
        (name = "Extraction", description = "Diagnostic fingerprint extraction, bypasses the store"),
        (name = "Health", description = "Service health and readiness endpoints")
    ),
    paths(
        crate::handlers::health::health,
        crate::handlers::health::ready,
        crate::handlers::enroll::enroll_handler,
        crate::handlers::verify::verify_handler,
        crate::handlers::extract::extract_handler,
        crate::handlers::identities::list_identities_handler,
        crate::handlers::identities::delete_identity_handler,
    ),
    components(
        schemas(
            HealthResponse,
            ReadyResponse,
            EnrollResponse,
            VerifyResponse,
            ExtractResponse,
            ListIdentitiesResponse,
            DeleteResponse,
        )
    )
)]
pub struct ApiDoc;
