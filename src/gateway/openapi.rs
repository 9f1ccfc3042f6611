//! OpenAPI / Swagger UI Documentation
//!
//! - Swagger UI: `http://localhost:8090/docs`
//! - OpenAPI JSON: `http://localhost:8090/api-docs/openapi.json`

use utoipa::openapi::security::{ApiKey, ApiKeyValue, SecurityScheme};
use utoipa::{Modify, OpenApi};

use crate::gateway::handlers::HealthResponse;
use crate::gateway::types::{CreatePaymentBody, RefundBody, WebhookAck, WechatAck};

/// Caller identity forwarded by the upstream API gateway
struct UserIdAddon;

impl Modify for UserIdAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "user_id",
                SecurityScheme::ApiKey(ApiKey::Header(ApiKeyValue::with_description(
                    "x-user-id",
                    "Authenticated user id, injected by the API gateway. `user-id` is accepted as a fallback.",
                ))),
            );
        }
    }
}

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Billing Payments API",
        version = "1.0.0",
        description = "Payment creation, gateway notifications, refunds and payment queries for billing orders."
    ),
    servers(
        (url = "http://localhost:8090", description = "Development"),
    ),
    paths(
        crate::gateway::handlers::health_check,
        crate::gateway::handlers::create_payment,
        crate::gateway::handlers::list_payments,
        crate::gateway::handlers::get_payment,
        crate::gateway::handlers::query_payment,
        crate::gateway::handlers::refund_payment,
        crate::gateway::handlers::get_saga,
        crate::gateway::handlers::provider_config,
        crate::gateway::webhooks::handle_notify,
    ),
    components(
        schemas(
            HealthResponse,
            CreatePaymentBody,
            RefundBody,
            WebhookAck,
            WechatAck,
        )
    ),
    modifiers(&UserIdAddon),
    tags(
        (name = "Payments", description = "Payment lifecycle and refunds"),
        (name = "Webhooks", description = "Gateway notifications (signature verified)"),
        (name = "System", description = "Health checks")
    )
)]
pub struct ApiDoc;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_openapi_spec_generates() {
        let spec = ApiDoc::openapi();
        assert_eq!(spec.info.title, "Billing Payments API");
        assert!(spec.to_json().is_ok());
    }

    #[test]
    fn test_payment_endpoints_registered() {
        let paths = ApiDoc::openapi().paths.paths;
        assert!(paths.contains_key("/api/billing/payments"));
        assert!(paths.contains_key("/api/billing/payments/{id}/refund"));
        assert!(paths.contains_key("/api/billing/payments/notify/{method}"));
        assert!(paths.contains_key("/api/billing/payments/query/{payment_no}"));
    }

    #[test]
    fn test_user_id_scheme_registered() {
        let components = ApiDoc::openapi().components.expect("should have components");
        assert!(components.security_schemes.contains_key("user_id"));
    }
}
