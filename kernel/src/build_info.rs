// Build Metadata
//
// Compile-time identity of the kernel, printed once at boot and on fatal
// halts so serial logs can be matched to a build.

macro_rules! define_build_meta {
    ($kernel_name:literal, $version:literal, $milestone:literal) => {
        pub const KERNEL_NAME: &str = $kernel_name;
        pub const VERSION_TAG: &str = concat!($kernel_name, " v", $version);
        pub const BOOT_BANNER: &str = concat!($kernel_name, " v", $version, " - ", $milestone);
    };
}

define_build_meta!("Quark Kernel", "0.1.0", "User Environments & Trap Dispatch");
