pub mod acme_client;
pub mod authorization;
pub mod install;
pub mod jose;
pub mod keys;
pub mod order;
pub mod proof;
pub mod protocol;
pub mod run;

pub use authorization::{AuthorizationError, AuthorizationResolver, ResolutionReport};
pub use install::{CertificateInstaller, InstallError, InstallOutcome};
pub use keys::{KeyError, KeyPair, SigningRequest};
pub use order::{Issued, OrderError, OrderOrchestrator, Registration, RegistrationError};
pub use proof::{ChannelError, CleanupFailed, ProofObject, ProofObjectChannel, VerificationError};
pub use protocol::{AcmeProtocol, Account, Authorization, Challenge, Order, ProtocolError, Status};
pub use run::{Collaborators, ProvisioningRun, RunError, RunReport, RunSettings};
