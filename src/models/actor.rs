use uuid::Uuid;

/// Who is performing an operation. Users are project parties, operators are
/// platform staff (mediators, arbitrators), the system covers sweeps and
/// webhook-driven changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Actor {
    User(Uuid),
    Operator(Uuid),
    System,
}

impl Actor {
    pub fn id(&self) -> Option<Uuid> {
        match self {
            Actor::User(id) | Actor::Operator(id) => Some(*id),
            Actor::System => None,
        }
    }

    pub fn is_user(&self, user_id: Uuid) -> bool {
        matches!(self, Actor::User(id) if *id == user_id)
    }

    pub fn is_operator(&self) -> bool {
        matches!(self, Actor::Operator(_))
    }

    pub fn describe(&self) -> String {
        match self {
            Actor::User(id) => format!("user:{}", id),
            Actor::Operator(id) => format!("operator:{}", id),
            Actor::System => "system".to_string(),
        }
    }
}

/// Carried through every service call so audit entries and error responses
/// share one correlation id.
#[derive(Debug, Clone, Copy)]
pub struct OperationContext {
    pub actor: Actor,
    pub correlation_id: Uuid,
}

impl OperationContext {
    pub fn new(actor: Actor) -> Self {
        Self {
            actor,
            correlation_id: Uuid::new_v4(),
        }
    }

    pub fn with_correlation(actor: Actor, correlation_id: Uuid) -> Self {
        Self {
            actor,
            correlation_id,
        }
    }

    pub fn system() -> Self {
        Self::new(Actor::System)
    }
}
