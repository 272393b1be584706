//! The fixed steps of an install and the percentages the frontend shows
//! for them. The numbers are part of the D-Bus contract and must not
//! drift between releases.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stage {
    pub name: &'static str,
    pub label: &'static str,
    pub start: u8,
    pub end: u8,
}

pub const PARTITION: Stage = Stage {
    name: "partition",
    label: "Partitioning disk...",
    start: 5,
    end: 15,
};

pub const FORMAT: Stage = Stage {
    name: "format",
    label: "Formatting partitions...",
    start: 15,
    end: 20,
};

pub const MOUNT: Stage = Stage {
    name: "mount",
    label: "Mounting partitions...",
    start: 20,
    end: 25,
};

pub const BOOTSTRAP: Stage = Stage {
    name: "bootstrap",
    label: "Installing base system (this can take a while)...",
    start: 25,
    end: 60,
};

pub const FSTAB: Stage = Stage {
    name: "fstab",
    label: "Generating fstab...",
    start: 60,
    end: 65,
};

pub const CONFIGURE: Stage = Stage {
    name: "configure",
    label: "Configuring the new system...",
    start: 65,
    end: 85,
};

pub const BOOTLOADER: Stage = Stage {
    name: "bootloader",
    label: "Installing bootloader...",
    start: 85,
    end: 88,
};

pub const DESKTOP: Stage = Stage {
    name: "desktop",
    label: "Installing desktop environment...",
    start: 88,
    end: 97,
};

pub const CLEANUP: Stage = Stage {
    name: "cleanup",
    label: "Cleaning up...",
    start: 97,
    end: 100,
};

pub const DONE: Stage = Stage {
    name: "done",
    label: "Installation finished!",
    start: 100,
    end: 100,
};

pub const ALL: &[Stage] = &[
    PARTITION, FORMAT, MOUNT, BOOTSTRAP, FSTAB, CONFIGURE, BOOTLOADER, DESKTOP, CLEANUP, DONE,
];
