//! Domain model (IDs, records, errors, events).

pub mod container;
pub mod errors;
pub mod events;
pub mod ids;
pub mod image;

pub use self::container::{
    Container, ContainerImage, ContainerStatus, ContainerUpdate, ResourceLimits,
};
pub use self::errors::{ControlError, ErrorKind};
pub use self::events::{DomainEvent, EventRecord};
pub use self::ids::{ContainerId, DockerImageId, Id, IdMarker, ParseIdError, UploadedImageId};
pub use self::image::{DEFAULT_TAG, DockerImage, ImageIdentity, UploadStatus, UploadedImage};
