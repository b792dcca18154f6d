//! Thread-confined playback resource hub.
//!
//! One affinity executor owns the player. Proxies forward every operation to
//! it, the lifecycle creates and releases the instance, the registry and sync
//! broker connect external consumers, and the arbiter decides whether the
//! local presentation surface may show controls.

pub mod arbiter;
pub mod broker;
pub mod call_bridge;
pub mod config;
pub mod error;
pub mod events;
pub mod executor;
pub mod hub;
pub mod lifecycle;
pub mod proxy;
pub mod registry;
pub mod resource;
pub mod sim;

pub use arbiter::{
    EnvironmentFlag, EnvironmentSignal, PresentationArbiter, PresentationSurface, Reconcile,
    SurfaceToken, is_takeover_id,
};
pub use broker::{Clock, ConsumerPort, ManualClock, SyncBroker, SyncOutcome, SystemClock};
pub use call_bridge::BlockingCallBridge;
pub use config::{HubConfig, HubConfigFile};
pub use error::{HubError, HubResult};
pub use events::{EventSink, ResourceEvent, ResourceListener};
pub use executor::{AffinityExecutor, ExecutorId, Task};
pub use hub::{PlaybackHub, PlaybackHubBuilder};
pub use lifecycle::{BindingHandle, CancelToken, InstanceLifecycle, LifecycleObserver, LifecycleState};
pub use proxy::{Command, Query, QueryValue, ResourceProxy};
pub use registry::{Consumer, ConsumerRegistry, RegistryChange, RegistryListener};
pub use resource::{PlaybackResource, ResourceFactory};
