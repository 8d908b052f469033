pub mod escalation;

pub use escalation::{
    detect_access_denial, is_permission_error, suggest_escalation, AccessDenial, Capability,
    PermissionEscalationRequest, PermissionLevel,
};
