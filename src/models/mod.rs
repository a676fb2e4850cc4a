pub mod actor;
pub mod auditmodel;
pub mod disputemodel;
pub mod escrowmodel;
pub mod milestonemodel;
pub mod projectmodel;
pub mod webhookmodel;
