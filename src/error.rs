#[repr(isize)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    AllocError = -1,
    InvalidPage = -2,
    InvalidAddress = -3,
    InvalidPte = -4,
    Fs = -5,

    /// container table is full
    ContainerCapacity = -10,
    /// process table (global or per-container) is full
    ProcessCapacity = -11,
    /// no container with that name or cid exists
    ContainerNotFound = -12,
    /// a container with that name already exists
    ContainerExists = -13,
    /// the requested transition is not legal from the container's current state
    InvalidContainerState = -14,
    /// the operation is not permitted by policy (e.g. root container teardown)
    Policy = -15,
    /// rootpath could not be resolved to a directory inode
    PathResolution = -16,
    /// wait() found no children to reap
    NoChildren = -17,
}

impl From<core::alloc::AllocError> for KernelError {
    fn from(_value: core::alloc::AllocError) -> Self {
        Self::AllocError
    }
}

impl KernelError {
    pub fn as_str(&self) -> &'static str {
        match self {
            KernelError::AllocError => "alloc error",
            KernelError::InvalidPage => "invalid page",
            KernelError::InvalidAddress => "invalid address",
            KernelError::InvalidPte => "invalid pte",
            KernelError::Fs => "filesystem error",
            KernelError::ContainerCapacity => "container table full",
            KernelError::ProcessCapacity => "process table full",
            KernelError::ContainerNotFound => "no such container",
            KernelError::ContainerExists => "container already exists",
            KernelError::InvalidContainerState => "invalid container state for operation",
            KernelError::Policy => "operation not permitted",
            KernelError::PathResolution => "could not resolve rootpath",
            KernelError::NoChildren => "no children to wait for",
        }
    }
}

impl core::fmt::Display for KernelError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}
