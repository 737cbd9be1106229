//! Self-description of the RPC surface.

use axum::Json;
use serde::Serialize;

/// One service group and its methods.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ServiceDescriptor {
    pub name: &'static str,
    pub path: &'static str,
    pub methods: &'static [&'static str],
}

pub const SERVICES: &[ServiceDescriptor] = &[
    ServiceDescriptor {
        name: "sdnagent.vswitch.v1.VSwitch",
        path: "/v1/vswitch",
        methods: &[
            "ListBridges",
            "EnsureBridge",
            "DeleteBridge",
            "ListPorts",
            "AddPort",
            "DeletePort",
        ],
    },
    ServiceDescriptor {
        name: "sdnagent.openflow.v1.OpenFlow",
        path: "/v1/openflow",
        methods: &[
            "GetFlows",
            "ReplaceFlows",
            "AddFlows",
            "DeleteFlows",
            "ClearFlows",
        ],
    },
    ServiceDescriptor {
        name: "sdnagent.reflection.v1.Reflection",
        path: "/v1/reflection",
        methods: &["ListServices"],
    },
];

#[derive(Debug, Serialize)]
pub struct ReflectionResponse {
    pub services: &'static [ServiceDescriptor],
}

pub async fn list_services() -> Json<ReflectionResponse> {
    Json(ReflectionResponse { services: SERVICES })
}
