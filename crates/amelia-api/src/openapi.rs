use utoipa::OpenApi;

use amelia_contracts::{
    event::{Agent, Event, EventType},
    workflow::{Workflow, WorkflowStatus},
};

#[derive(OpenApi)]
#[openapi(
    paths(
        crate::routes::workflows::create_workflow,
        crate::routes::workflows::list_workflows,
        crate::routes::workflows::get_workflow,
        crate::routes::workflows::approve,
        crate::routes::workflows::reject,
        crate::routes::workflows::cancel,
        crate::routes::workflows::list_events,
        crate::routes::health::live,
        crate::routes::health::ready,
    ),
    components(schemas(
        Workflow,
        WorkflowStatus,
        Event,
        EventType,
        Agent,
        crate::routes::workflows::CreateWorkflowRequest,
        crate::routes::workflows::CreateWorkflowResponse,
        crate::routes::workflows::ApproveRequest,
        crate::routes::workflows::RejectRequest,
    )),
    tags(
        (name = "workflows", description = "Workflow admission, approval, and event history"),
        (name = "health", description = "Liveness and readiness probes"),
    ),
    info(
        title = "Amelia Orchestration API",
        version = "0.1.0",
        description = "Drives plan/approve/execute/review workflows against a git worktree",
        license(name = "MIT", url = "https://opensource.org/licenses/MIT")
    )
)]
pub struct ApiDoc;
