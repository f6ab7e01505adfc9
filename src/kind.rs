//! Program classification: kinds, expected attach kinds, and the mapping
//! from executable section names to both.

use crate::error::{InvalidInputSnafu, Result};

/// The kind a program is submitted to the kernel as.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ProgramKind {
    #[default]
    Unspec = 0,
    SocketFilter = 1,
    Kprobe = 2,
    SchedCls = 3,
    SchedAct = 4,
    Tracepoint = 5,
    Xdp = 6,
    PerfEvent = 7,
    CgroupSkb = 8,
    CgroupSock = 9,
    LwtIn = 10,
    LwtOut = 11,
    LwtXmit = 12,
    SockOps = 13,
    SkSkb = 14,
    CgroupDevice = 15,
    SkMsg = 16,
    RawTracepoint = 17,
    CgroupSockAddr = 18,
    LwtSeg6local = 19,
    LircMode2 = 20,
}

impl ProgramKind {
    pub fn from_u32(kind: u32) -> Option<Self> {
        use ProgramKind::*;
        Some(match kind {
            0 => Unspec,
            1 => SocketFilter,
            2 => Kprobe,
            3 => SchedCls,
            4 => SchedAct,
            5 => Tracepoint,
            6 => Xdp,
            7 => PerfEvent,
            8 => CgroupSkb,
            9 => CgroupSock,
            10 => LwtIn,
            11 => LwtOut,
            12 => LwtXmit,
            13 => SockOps,
            14 => SkSkb,
            15 => CgroupDevice,
            16 => SkMsg,
            17 => RawTracepoint,
            18 => CgroupSockAddr,
            19 => LwtSeg6local,
            20 => LircMode2,
            _ => return None,
        })
    }

    pub fn to_u32(self) -> u32 {
        self as u32
    }

    /// Whether programs of this kind must be submitted with a declared
    /// kernel version. The unspecified and tracing kinds do; the network
    /// and cgroup hooks do not.
    pub fn needs_kernel_version(self) -> bool {
        use ProgramKind::*;
        !matches!(
            self,
            SocketFilter
                | SchedCls
                | SchedAct
                | Xdp
                | CgroupSkb
                | CgroupSock
                | LwtIn
                | LwtOut
                | LwtXmit
                | LwtSeg6local
                | SockOps
                | SkSkb
                | CgroupDevice
                | SkMsg
                | CgroupSockAddr
                | LircMode2
        )
    }
}

/// The attach point a program expects, for kinds whose attach point is
/// fixed at load time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum AttachKind {
    CgroupInetIngress = 0,
    CgroupInetEgress = 1,
    CgroupInetSockCreate = 2,
    CgroupSockOps = 3,
    SkSkbStreamParser = 4,
    SkSkbStreamVerdict = 5,
    CgroupDevice = 6,
    SkMsgVerdict = 7,
    CgroupInet4Bind = 8,
    CgroupInet6Bind = 9,
    CgroupInet4Connect = 10,
    CgroupInet6Connect = 11,
    CgroupInet4PostBind = 12,
    CgroupInet6PostBind = 13,
    CgroupUdp4Sendmsg = 14,
    CgroupUdp6Sendmsg = 15,
    LircMode2 = 16,
}

impl AttachKind {
    pub fn to_u32(self) -> u32 {
        self as u32
    }
}

/// Ordered section-prefix table; the first matching prefix wins. Only the
/// cgroup sock-addr and post-bind hooks pin an expected attach kind.
#[rustfmt::skip]
const SECTION_KINDS: &[(&str, ProgramKind, Option<AttachKind>)] = &[
    ("socket",              ProgramKind::SocketFilter,   None),
    ("kprobe/",             ProgramKind::Kprobe,         None),
    ("kretprobe/",          ProgramKind::Kprobe,         None),
    ("classifier",          ProgramKind::SchedCls,       None),
    ("action",              ProgramKind::SchedAct,       None),
    ("tracepoint/",         ProgramKind::Tracepoint,     None),
    ("raw_tracepoint/",     ProgramKind::RawTracepoint,  None),
    ("xdp",                 ProgramKind::Xdp,            None),
    ("perf_event",          ProgramKind::PerfEvent,      None),
    ("cgroup/skb",          ProgramKind::CgroupSkb,      None),
    ("cgroup/sock",         ProgramKind::CgroupSock,     None),
    ("cgroup/dev",          ProgramKind::CgroupDevice,   None),
    ("lwt_in",              ProgramKind::LwtIn,          None),
    ("lwt_out",             ProgramKind::LwtOut,         None),
    ("lwt_xmit",            ProgramKind::LwtXmit,        None),
    ("lwt_seg6local",       ProgramKind::LwtSeg6local,   None),
    ("sockops",             ProgramKind::SockOps,        None),
    ("sk_skb",              ProgramKind::SkSkb,          None),
    ("sk_msg",              ProgramKind::SkMsg,          None),
    ("lirc_mode2",          ProgramKind::LircMode2,      None),
    ("cgroup/bind4",        ProgramKind::CgroupSockAddr, Some(AttachKind::CgroupInet4Bind)),
    ("cgroup/bind6",        ProgramKind::CgroupSockAddr, Some(AttachKind::CgroupInet6Bind)),
    ("cgroup/connect4",     ProgramKind::CgroupSockAddr, Some(AttachKind::CgroupInet4Connect)),
    ("cgroup/connect6",     ProgramKind::CgroupSockAddr, Some(AttachKind::CgroupInet6Connect)),
    ("cgroup/sendmsg4",     ProgramKind::CgroupSockAddr, Some(AttachKind::CgroupUdp4Sendmsg)),
    ("cgroup/sendmsg6",     ProgramKind::CgroupSockAddr, Some(AttachKind::CgroupUdp6Sendmsg)),
    ("cgroup/post_bind4",   ProgramKind::CgroupSock,     Some(AttachKind::CgroupInet4PostBind)),
    ("cgroup/post_bind6",   ProgramKind::CgroupSock,     Some(AttachKind::CgroupInet6PostBind)),
];

/// Infer a program kind and expected attach kind from its section name.
pub fn kind_for_section(name: &str) -> Result<(ProgramKind, Option<AttachKind>)> {
    for (prefix, kind, attach) in SECTION_KINDS {
        if name.starts_with(prefix) {
            return Ok((*kind, *attach));
        }
    }
    InvalidInputSnafu {
        what: format!("no program kind matches section name '{name}'"),
    }
    .fail()
}
