//! The command dispatch table: every protocol command with its permission
//! mask and argument-count contract, plus the handlers.

use std::fmt::Write as _;

use camino::{Utf8Path, Utf8PathBuf};
use itertools::Itertools;
use strum::IntoEnumIterator;

use crate::config::permission;
use crate::db::directory::{Directory, Visitor};
use crate::idle::SubSystem;
use crate::playlist::stored;
use crate::protocol::{
    Ack, AckError, AckResult, Range, SeekTarget, parse_bool, parse_float, parse_signed,
    parse_unsigned, print_queue_song, print_song, response,
};
use crate::song::SongHandle;
use crate::system::System;
use crate::tag::TagType;

/// What the session loop does after a successful command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandResult {
    /// response body; the caller appends `OK` / `list_OK`
    Ok(String),
    /// close this connection
    Close,
    /// shut the whole server down
    Kill,
}

pub struct CommandContext<'a> {
    pub system: &'a mut System,
    /// the session's permission bits; `password` upgrades them
    pub permission: &'a mut u8,
}

type Handler = fn(&mut CommandContext<'_>, &[String]) -> AckResult<CommandResult>;

pub struct CommandDef {
    pub name: &'static str,
    pub permission: u8,
    min: usize,
    /// -1 = unlimited
    max: i32,
    handler: Handler,
}

const fn def(
    name: &'static str,
    permission: u8,
    min: usize,
    max: i32,
    handler: Handler,
) -> CommandDef {
    CommandDef {
        name,
        permission,
        min,
        max,
        handler,
    }
}

/// The table; kept sorted by name. `idle`/`noidle` appear here for
/// reflection but are intercepted by the session loop.
pub static COMMANDS: &[CommandDef] = &[
    def("add", permission::ADD, 1, 1, handle_add),
    def("addid", permission::ADD, 1, 2, handle_addid),
    def("clear", permission::CONTROL, 0, 0, handle_clear),
    def("clearerror", permission::CONTROL, 0, 0, handle_clearerror),
    def("close", 0, 0, 0, |_, _| Ok(CommandResult::Close)),
    def("commands", 0, 0, 0, handle_commands),
    def("consume", permission::CONTROL, 1, 1, handle_consume),
    def("count", permission::READ, 2, -1, handle_count),
    def("crossfade", permission::CONTROL, 1, 1, handle_crossfade),
    def("currentsong", permission::READ, 0, 0, handle_currentsong),
    def("decoders", permission::READ, 0, 0, handle_decoders),
    def("delete", permission::CONTROL, 1, 1, handle_delete),
    def("deleteid", permission::CONTROL, 1, 1, handle_deleteid),
    def("disableoutput", permission::ADMIN, 1, 1, handle_disableoutput),
    def("enableoutput", permission::ADMIN, 1, 1, handle_enableoutput),
    def("find", permission::READ, 2, -1, handle_find),
    def("idle", permission::READ, 0, -1, handle_idle_in_list),
    def("kill", permission::ADMIN, 0, 0, |_, _| Ok(CommandResult::Kill)),
    def("list", permission::READ, 1, -1, handle_list),
    def("listall", permission::READ, 0, 1, handle_listall),
    def("listallinfo", permission::READ, 0, 1, handle_listallinfo),
    def("listplaylist", permission::READ, 1, 1, handle_listplaylist),
    def("listplaylistinfo", permission::READ, 1, 1, handle_listplaylistinfo),
    def("listplaylists", permission::READ, 0, 0, handle_listplaylists),
    def("load", permission::ADD, 1, 1, handle_load),
    def("lsinfo", permission::READ, 0, 1, handle_lsinfo),
    def("move", permission::CONTROL, 2, 2, handle_move),
    def("moveid", permission::CONTROL, 2, 2, handle_moveid),
    def("next", permission::CONTROL, 0, 0, handle_next),
    def("noidle", permission::READ, 0, 0, handle_idle_in_list),
    def("notcommands", 0, 0, 0, handle_notcommands),
    def("outputs", permission::READ, 0, 0, handle_outputs),
    def("password", 0, 1, 1, handle_password),
    def("pause", permission::CONTROL, 0, 1, handle_pause),
    def("ping", 0, 0, 0, |_, _| Ok(CommandResult::Ok(String::new()))),
    def("play", permission::CONTROL, 0, 1, handle_play),
    def("playid", permission::CONTROL, 0, 1, handle_playid),
    def("playlist", permission::READ, 0, 0, handle_playlist),
    def("playlistadd", permission::CONTROL, 2, 2, handle_playlistadd),
    def("playlistclear", permission::CONTROL, 1, 1, handle_playlistclear),
    def("playlistdelete", permission::CONTROL, 2, 2, handle_playlistdelete),
    def("playlistfind", permission::READ, 2, -1, handle_playlistfind),
    def("playlistid", permission::READ, 0, 1, handle_playlistid),
    def("playlistinfo", permission::READ, 0, 1, handle_playlistinfo),
    def("playlistmove", permission::CONTROL, 3, 3, handle_playlistmove),
    def("playlistsearch", permission::READ, 2, -1, handle_playlistsearch),
    def("plchanges", permission::READ, 1, 1, handle_plchanges),
    def("plchangesposid", permission::READ, 1, 1, handle_plchangesposid),
    def("previous", permission::CONTROL, 0, 0, handle_previous),
    def("prio", permission::CONTROL, 2, -1, handle_prio),
    def("prioid", permission::CONTROL, 2, -1, handle_prioid),
    def("random", permission::CONTROL, 1, 1, handle_random),
    def("rename", permission::CONTROL, 2, 2, handle_rename),
    def("repeat", permission::CONTROL, 1, 1, handle_repeat),
    def("rm", permission::CONTROL, 1, 1, handle_rm),
    def("save", permission::CONTROL, 1, 1, handle_save),
    def("search", permission::READ, 2, -1, handle_search),
    def("seek", permission::CONTROL, 2, 2, handle_seek),
    def("seekcur", permission::CONTROL, 1, 1, handle_seekcur),
    def("seekid", permission::CONTROL, 2, 2, handle_seekid),
    def("setvol", permission::CONTROL, 1, 1, handle_setvol),
    def("shuffle", permission::CONTROL, 0, 1, handle_shuffle),
    def("single", permission::CONTROL, 1, 1, handle_single),
    def("stats", permission::READ, 0, 0, handle_stats),
    def("status", permission::READ, 0, 0, handle_status),
    def("stop", permission::CONTROL, 0, 0, handle_stop),
    def("swap", permission::CONTROL, 2, 2, handle_swap),
    def("swapid", permission::CONTROL, 2, 2, handle_swapid),
    def("tagtypes", permission::READ, 0, 0, handle_tagtypes),
    def("update", permission::ADMIN, 0, 1, handle_update),
    def("urlhandlers", permission::READ, 0, 0, handle_urlhandlers),
    def("volume", permission::CONTROL, 1, 1, handle_volume),
];

pub fn find(name: &str) -> Option<&'static CommandDef> {
    COMMANDS.iter().find(|def| def.name == name)
}

/// Look up, authorize and run one command.
pub fn execute(
    ctx: &mut CommandContext<'_>,
    name: &str,
    args: &[String],
) -> AckResult<CommandResult> {
    let Some(def) = find(name) else {
        return Err(AckError::new(
            Ack::Unknown,
            format!("unknown command \"{name}\""),
        ));
    };

    if *ctx.permission & def.permission != def.permission {
        return Err(AckError::new(
            Ack::Permission,
            format!("you don't have permission for \"{name}\""),
        ));
    }

    if args.len() < def.min || (def.max >= 0 && args.len() > def.max as usize) {
        return Err(AckError::new(
            Ack::Arg,
            format!("wrong number of arguments for \"{name}\""),
        ));
    }

    (def.handler)(ctx, args)
}

fn ok(body: String) -> AckResult<CommandResult> {
    Ok(CommandResult::Ok(body))
}

fn empty() -> AckResult<CommandResult> {
    ok(String::new())
}

fn serialize<T: serde::Serialize>(value: &T) -> AckResult<CommandResult> {
    response::to_string(value)
        .map(CommandResult::Ok)
        .map_err(|e| AckError::system(e.to_string()))
}

// ----- status family --------------------------------------------------

fn handle_status(ctx: &mut CommandContext<'_>, _args: &[String]) -> AckResult<CommandResult> {
    serialize(&ctx.system.status())
}

fn handle_stats(ctx: &mut CommandContext<'_>, _args: &[String]) -> AckResult<CommandResult> {
    serialize(&ctx.system.stats())
}

fn handle_clearerror(
    ctx: &mut CommandContext<'_>,
    _args: &[String],
) -> AckResult<CommandResult> {
    ctx.system.pc.clear_error();
    empty()
}

fn handle_currentsong(
    ctx: &mut CommandContext<'_>,
    _args: &[String],
) -> AckResult<CommandResult> {
    let mut out = String::new();
    if let Some((position, id, song)) = ctx.system.playlist.current_song() {
        print_queue_song(&mut out, &song, position, id);
    }
    ok(out)
}

fn handle_idle_in_list(
    _ctx: &mut CommandContext<'_>,
    _args: &[String],
) -> AckResult<CommandResult> {
    // the session loop intercepts idle; getting here means it was buried
    // in a command list
    Err(AckError::new(Ack::Arg, "idle not allowed here"))
}

// ----- playback control -----------------------------------------------

fn optional_position(args: &[String]) -> AckResult<Option<usize>> {
    args.first()
        .map(|arg| parse_unsigned(arg).map(|v| v as usize))
        .transpose()
}

fn handle_play(ctx: &mut CommandContext<'_>, args: &[String]) -> AckResult<CommandResult> {
    let position = optional_position(args)?;
    ctx.system.playlist.play(position)?;
    empty()
}

fn handle_playid(ctx: &mut CommandContext<'_>, args: &[String]) -> AckResult<CommandResult> {
    let id = args.first().map(|arg| parse_unsigned(arg)).transpose()?;
    ctx.system.playlist.play_id(id)?;
    empty()
}

fn handle_stop(ctx: &mut CommandContext<'_>, _args: &[String]) -> AckResult<CommandResult> {
    ctx.system.playlist.stop();
    empty()
}

fn handle_pause(ctx: &mut CommandContext<'_>, args: &[String]) -> AckResult<CommandResult> {
    match args.first() {
        Some(arg) => ctx.system.pc.set_pause(parse_bool(arg)?),
        None => ctx.system.pc.pause_toggle(),
    }
    ctx.system.idle.emit(SubSystem::Player);
    empty()
}

fn handle_next(ctx: &mut CommandContext<'_>, _args: &[String]) -> AckResult<CommandResult> {
    ctx.system.playlist.next();
    empty()
}

fn handle_previous(
    ctx: &mut CommandContext<'_>,
    _args: &[String],
) -> AckResult<CommandResult> {
    ctx.system.playlist.previous();
    empty()
}

fn handle_seek(ctx: &mut CommandContext<'_>, args: &[String]) -> AckResult<CommandResult> {
    let position = parse_unsigned(&args[0])? as usize;
    let seconds = parse_float(&args[1])?;
    ctx.system.playlist.seek(position, seconds)?;
    empty()
}

fn handle_seekid(ctx: &mut CommandContext<'_>, args: &[String]) -> AckResult<CommandResult> {
    let id = parse_unsigned(&args[0])?;
    let seconds = parse_float(&args[1])?;
    ctx.system.playlist.seek_id(id, seconds)?;
    empty()
}

fn handle_seekcur(ctx: &mut CommandContext<'_>, args: &[String]) -> AckResult<CommandResult> {
    let target = match SeekTarget::parse(&args[0])? {
        SeekTarget::Absolute(seconds) => seconds,
        SeekTarget::Relative(delta) => f64::from(ctx.system.pc.elapsed_time()) + delta,
    };
    ctx.system.playlist.seek_current(target)?;
    empty()
}

fn handle_crossfade(
    ctx: &mut CommandContext<'_>,
    args: &[String],
) -> AckResult<CommandResult> {
    let seconds = parse_unsigned(&args[0])?;
    ctx.system.pc.set_cross_fade_seconds(seconds as f32);
    ctx.system.idle.emit(SubSystem::Options);
    empty()
}

fn handle_setvol(ctx: &mut CommandContext<'_>, args: &[String]) -> AckResult<CommandResult> {
    let volume = parse_unsigned(&args[0])?;
    ctx.system
        .set_volume(volume.try_into().map_err(|_| {
            AckError::new(Ack::Arg, "Invalid volume value")
        })?)?;
    empty()
}

fn handle_volume(ctx: &mut CommandContext<'_>, args: &[String]) -> AckResult<CommandResult> {
    let change = parse_signed(&args[0])?;
    let current = i64::from(ctx.system.sw_volume());
    let target = (current + change).clamp(0, 100) as u8;
    ctx.system.set_volume(target)?;
    empty()
}

// ----- playback options -----------------------------------------------

fn handle_repeat(ctx: &mut CommandContext<'_>, args: &[String]) -> AckResult<CommandResult> {
    let value = parse_bool(&args[0])?;
    ctx.system.playlist.set_repeat(value);
    empty()
}

fn handle_random(ctx: &mut CommandContext<'_>, args: &[String]) -> AckResult<CommandResult> {
    let value = parse_bool(&args[0])?;
    ctx.system.playlist.set_random(value);
    empty()
}

fn handle_single(ctx: &mut CommandContext<'_>, args: &[String]) -> AckResult<CommandResult> {
    let value = parse_bool(&args[0])?;
    ctx.system.playlist.set_single(value);
    empty()
}

fn handle_consume(ctx: &mut CommandContext<'_>, args: &[String]) -> AckResult<CommandResult> {
    let value = parse_bool(&args[0])?;
    ctx.system.playlist.set_consume(value);
    empty()
}

// ----- queue edits ----------------------------------------------------

fn handle_add(ctx: &mut CommandContext<'_>, args: &[String]) -> AckResult<CommandResult> {
    let uri = Utf8Path::new(&args[0]);
    let system = &mut *ctx.system;

    if system.db.directory_exists(uri) && !crate::song::uri_has_scheme(uri.as_str()) {
        // adding a directory adds its whole sub-tree, in walk order
        let mut uris = UriCollector::default();
        system
            .db
            .walk(Some(uri).filter(|u| !u.as_str().is_empty()), &mut uris)
            .map_err(|_| AckError::no_such_song())?;
        if uris.0.is_empty() && !uri.as_str().is_empty() {
            return Err(AckError::no_such_song());
        }
        for song_uri in uris.0 {
            system
                .playlist
                .append_uri(&system.db, Utf8Path::new(&song_uri))?;
        }
        return empty();
    }

    system.playlist.append_uri(&system.db, uri)?;
    empty()
}

fn handle_addid(ctx: &mut CommandContext<'_>, args: &[String]) -> AckResult<CommandResult> {
    let uri = Utf8Path::new(&args[0]);
    let system = &mut *ctx.system;
    let id = system.playlist.append_uri(&system.db, uri)?;

    if let Some(position) = args.get(1) {
        let to = parse_signed(position)?;
        system.playlist.move_id(id, to)?;
    }
    ok(format!("Id: {id}\n"))
}

fn handle_clear(ctx: &mut CommandContext<'_>, _args: &[String]) -> AckResult<CommandResult> {
    ctx.system.playlist.clear();
    empty()
}

fn handle_delete(ctx: &mut CommandContext<'_>, args: &[String]) -> AckResult<CommandResult> {
    let range = Range::parse(&args[0])?;
    let length = ctx.system.playlist.queue.len();
    let (start, end) = range.resolve(length)?;
    if end - start == 1 {
        ctx.system.playlist.delete(start)?;
    } else {
        ctx.system.playlist.delete_range(start, end)?;
    }
    empty()
}

fn handle_deleteid(ctx: &mut CommandContext<'_>, args: &[String]) -> AckResult<CommandResult> {
    let id = parse_unsigned(&args[0])?;
    ctx.system.playlist.delete_id(id)?;
    empty()
}

fn handle_move(ctx: &mut CommandContext<'_>, args: &[String]) -> AckResult<CommandResult> {
    let range = Range::parse(&args[0])?;
    let to = parse_signed(&args[1])?;
    let length = ctx.system.playlist.queue.len();
    let (start, end) = range.resolve(length)?;
    ctx.system.playlist.move_range(start, end, to)?;
    empty()
}

fn handle_moveid(ctx: &mut CommandContext<'_>, args: &[String]) -> AckResult<CommandResult> {
    let id = parse_unsigned(&args[0])?;
    let to = parse_signed(&args[1])?;
    ctx.system.playlist.move_id(id, to)?;
    empty()
}

fn handle_swap(ctx: &mut CommandContext<'_>, args: &[String]) -> AckResult<CommandResult> {
    let position1 = parse_unsigned(&args[0])? as usize;
    let position2 = parse_unsigned(&args[1])? as usize;
    ctx.system.playlist.swap(position1, position2)?;
    empty()
}

fn handle_swapid(ctx: &mut CommandContext<'_>, args: &[String]) -> AckResult<CommandResult> {
    let id1 = parse_unsigned(&args[0])?;
    let id2 = parse_unsigned(&args[1])?;
    ctx.system.playlist.swap_id(id1, id2)?;
    empty()
}

fn handle_shuffle(ctx: &mut CommandContext<'_>, args: &[String]) -> AckResult<CommandResult> {
    let length = ctx.system.playlist.queue.len();
    if length == 0 {
        return empty();
    }
    let (start, end) = match args.first() {
        Some(arg) => Range::parse(arg)?.resolve(length)?,
        None => (0, length),
    };
    ctx.system.playlist.shuffle(start, end)?;
    empty()
}

fn handle_prio(ctx: &mut CommandContext<'_>, args: &[String]) -> AckResult<CommandResult> {
    let priority = parse_priority(&args[0])?;
    let length = ctx.system.playlist.queue.len();
    for arg in &args[1..] {
        let (start, end) = Range::parse(arg)?.resolve(length)?;
        ctx.system.playlist.set_priority(start, end, priority)?;
    }
    empty()
}

fn handle_prioid(ctx: &mut CommandContext<'_>, args: &[String]) -> AckResult<CommandResult> {
    let priority = parse_priority(&args[0])?;
    for arg in &args[1..] {
        let id = parse_unsigned(arg)?;
        ctx.system.playlist.set_priority_id(id, priority)?;
    }
    empty()
}

fn parse_priority(arg: &str) -> AckResult<u8> {
    parse_unsigned(arg)?
        .try_into()
        .map_err(|_| AckError::new(Ack::Arg, "priority out of range"))
}

// ----- queue listings -------------------------------------------------

fn handle_playlist(ctx: &mut CommandContext<'_>, _args: &[String]) -> AckResult<CommandResult> {
    let mut out = String::new();
    for (position, item) in ctx.system.playlist.queue.items().iter().enumerate() {
        let _ = writeln!(out, "{position}:{}", item.song.uri);
    }
    ok(out)
}

fn handle_playlistinfo(
    ctx: &mut CommandContext<'_>,
    args: &[String],
) -> AckResult<CommandResult> {
    let queue = &ctx.system.playlist.queue;
    let (start, end) = match args.first() {
        Some(arg) => Range::parse(arg)?.resolve(queue.len())?,
        None => (0, queue.len()),
    };
    let mut out = String::new();
    for position in start..end {
        let item = queue.item(position);
        print_queue_song(&mut out, &item.song, position, item.id);
        if item.priority != 0 {
            let _ = writeln!(out, "Prio: {}", item.priority);
        }
    }
    ok(out)
}

fn handle_playlistid(
    ctx: &mut CommandContext<'_>,
    args: &[String],
) -> AckResult<CommandResult> {
    let queue = &ctx.system.playlist.queue;
    let mut out = String::new();
    match args.first() {
        Some(arg) => {
            let id = parse_unsigned(arg)?;
            let position = queue.id_to_position(id).ok_or_else(AckError::no_such_song)?;
            print_queue_song(&mut out, queue.get(position), position, id);
        }
        None => {
            for (position, item) in queue.items().iter().enumerate() {
                print_queue_song(&mut out, &item.song, position, item.id);
            }
        }
    }
    ok(out)
}

fn handle_plchanges(
    ctx: &mut CommandContext<'_>,
    args: &[String],
) -> AckResult<CommandResult> {
    let version = parse_unsigned(&args[0])?;
    let queue = &ctx.system.playlist.queue;
    let mut out = String::new();
    for (position, item) in queue.items().iter().enumerate() {
        if queue.song_newer(position, version) {
            print_queue_song(&mut out, &item.song, position, item.id);
        }
    }
    ok(out)
}

fn handle_plchangesposid(
    ctx: &mut CommandContext<'_>,
    args: &[String],
) -> AckResult<CommandResult> {
    let version = parse_unsigned(&args[0])?;
    let queue = &ctx.system.playlist.queue;
    let mut out = String::new();
    for (position, item) in queue.items().iter().enumerate() {
        if queue.song_newer(position, version) {
            let _ = writeln!(out, "cpos: {position}\nId: {}", item.id);
        }
    }
    ok(out)
}

fn handle_playlistfind(
    ctx: &mut CommandContext<'_>,
    args: &[String],
) -> AckResult<CommandResult> {
    queue_match(ctx, args, true)
}

fn handle_playlistsearch(
    ctx: &mut CommandContext<'_>,
    args: &[String],
) -> AckResult<CommandResult> {
    queue_match(ctx, args, false)
}

fn queue_match(
    ctx: &mut CommandContext<'_>,
    args: &[String],
    exact: bool,
) -> AckResult<CommandResult> {
    let filter = TagFilter::parse(args)?;
    let queue = &ctx.system.playlist.queue;
    let mut out = String::new();
    for (position, item) in queue.items().iter().enumerate() {
        if filter.matches(&item.song, exact) {
            print_queue_song(&mut out, &item.song, position, item.id);
        }
    }
    ok(out)
}

// ----- database browsing ----------------------------------------------

#[derive(Default)]
struct UriCollector(Vec<String>);

impl Visitor for UriCollector {
    fn on_song(&mut self, song: &SongHandle) -> color_eyre::Result<()> {
        self.0.push(song.uri.to_string());
        Ok(())
    }
}

fn walk_uri(args: &[String]) -> Option<Utf8PathBuf> {
    args.first()
        .filter(|uri| !uri.is_empty())
        .map(Utf8PathBuf::from)
}

fn db_walk(
    ctx: &mut CommandContext<'_>,
    uri: Option<&Utf8Path>,
    visitor: &mut dyn Visitor,
) -> AckResult<()> {
    ctx.system.db.walk(uri, visitor).map_err(|error| {
        match error.downcast::<AckError>() {
            Ok(ack) => ack,
            Err(_) => AckError::new(Ack::NoExist, "directory or file not found"),
        }
    })
}

fn handle_listall(ctx: &mut CommandContext<'_>, args: &[String]) -> AckResult<CommandResult> {
    struct Lines(String);
    impl Visitor for Lines {
        fn on_directory(&mut self, directory: &Directory) -> color_eyre::Result<()> {
            let _ = writeln!(self.0, "directory: {}", directory.path);
            Ok(())
        }
        fn on_song(&mut self, song: &SongHandle) -> color_eyre::Result<()> {
            let _ = writeln!(self.0, "file: {}", song.uri);
            Ok(())
        }
    }

    let mut lines = Lines(String::new());
    db_walk(ctx, walk_uri(args).as_deref(), &mut lines)?;
    ok(lines.0)
}

fn handle_listallinfo(
    ctx: &mut CommandContext<'_>,
    args: &[String],
) -> AckResult<CommandResult> {
    struct Records(String);
    impl Visitor for Records {
        fn on_directory(&mut self, directory: &Directory) -> color_eyre::Result<()> {
            let _ = writeln!(self.0, "directory: {}", directory.path);
            Ok(())
        }
        fn on_song(&mut self, song: &SongHandle) -> color_eyre::Result<()> {
            print_song(&mut self.0, song);
            Ok(())
        }
        fn on_playlist(
            &mut self,
            directory: &Directory,
            name: &str,
        ) -> color_eyre::Result<()> {
            if directory.is_root() {
                let _ = writeln!(self.0, "playlist: {name}");
            } else {
                let _ = writeln!(self.0, "playlist: {}/{name}", directory.path);
            }
            Ok(())
        }
    }

    let mut records = Records(String::new());
    db_walk(ctx, walk_uri(args).as_deref(), &mut records)?;
    ok(records.0)
}

fn handle_lsinfo(ctx: &mut CommandContext<'_>, args: &[String]) -> AckResult<CommandResult> {
    let uri = walk_uri(args);
    let mut out = String::new();

    // a song URI prints just that record
    if let Some(uri) = &uri
        && let Some(song) = ctx.system.db.get_song(uri)
    {
        print_song(&mut out, &song);
        return ok(out);
    }

    let found = ctx.system.db.with_root(|root| {
        let directory = match &uri {
            Some(uri) => root.lookup_directory(uri),
            None => Some(root),
        };
        let Some(directory) = directory else {
            return false;
        };
        for child in directory.children.values() {
            let _ = writeln!(out, "directory: {}", child.path);
            if let Some(mtime) = child.mtime
                && let Ok(stamp) = jiff::Timestamp::from_second(mtime)
            {
                let _ = writeln!(out, "Last-Modified: {stamp}");
            }
        }
        for song in directory.songs.values() {
            print_song(&mut out, song);
        }
        for name in directory.playlists.keys() {
            if directory.is_root() {
                let _ = writeln!(out, "playlist: {name}");
            } else {
                let _ = writeln!(out, "playlist: {}/{name}", directory.path);
            }
        }
        true
    });
    if !found {
        return Err(AckError::new(Ack::NoExist, "directory not found"));
    }

    // the root listing also shows the stored playlists
    if uri.is_none() {
        for (name, mtime) in stored::list(&ctx.system.config.playlist_directory) {
            let _ = writeln!(out, "playlist: {name}");
            if let Ok(stamp) = jiff::Timestamp::from_second(mtime) {
                let _ = writeln!(out, "Last-Modified: {stamp}");
            }
        }
    }
    ok(out)
}

/// `find`/`search`/`count` filters: `TYPE VALUE` pairs, where TYPE is a tag
/// type, `file`, or `any`.
enum FilterKind {
    Tag(TagType),
    File,
    Any,
}

struct TagFilter {
    terms: Vec<(FilterKind, String)>,
}

impl TagFilter {
    fn parse(args: &[String]) -> AckResult<Self> {
        if args.len() % 2 != 0 {
            return Err(AckError::new(Ack::Arg, "incorrect arguments"));
        }
        let mut terms = Vec::new();
        for (kind, value) in args.iter().tuples() {
            let kind = match kind.as_str() {
                "file" | "filename" => FilterKind::File,
                "any" => FilterKind::Any,
                other => FilterKind::Tag(
                    other
                        .parse::<TagType>()
                        .map_err(|_| AckError::new(Ack::Arg, format!("unknown type: {other}")))?,
                ),
            };
            terms.push((kind, value.clone()));
        }
        Ok(TagFilter { terms })
    }

    fn matches(&self, song: &SongHandle, exact: bool) -> bool {
        self.terms.iter().all(|(kind, needle)| match kind {
            FilterKind::File => value_matches(song.uri.as_str(), needle, exact),
            FilterKind::Any => {
                song.tag.as_ref().is_some_and(|tag| {
                    tag.items
                        .iter()
                        .any(|item| value_matches(&item.value, needle, exact))
                }) || value_matches(song.uri.as_str(), needle, exact)
            }
            FilterKind::Tag(tag_type) => song.tag.as_ref().is_some_and(|tag| {
                tag.values_of(*tag_type)
                    .any(|value| value_matches(value, needle, exact))
            }),
        })
    }
}

fn value_matches(value: &str, needle: &str, exact: bool) -> bool {
    if exact {
        value == needle
    } else {
        value.to_lowercase().contains(&needle.to_lowercase())
    }
}

fn db_match(
    ctx: &mut CommandContext<'_>,
    args: &[String],
    exact: bool,
) -> AckResult<String> {
    let filter = TagFilter::parse(args)?;
    struct Matcher<'f> {
        filter: &'f TagFilter,
        exact: bool,
        out: String,
    }
    impl Visitor for Matcher<'_> {
        fn on_song(&mut self, song: &SongHandle) -> color_eyre::Result<()> {
            if self.filter.matches(song, self.exact) {
                print_song(&mut self.out, song);
            }
            Ok(())
        }
    }
    let mut matcher = Matcher {
        filter: &filter,
        exact,
        out: String::new(),
    };
    db_walk(ctx, None, &mut matcher)?;
    Ok(matcher.out)
}

fn handle_find(ctx: &mut CommandContext<'_>, args: &[String]) -> AckResult<CommandResult> {
    db_match(ctx, args, true).map(CommandResult::Ok)
}

fn handle_search(ctx: &mut CommandContext<'_>, args: &[String]) -> AckResult<CommandResult> {
    db_match(ctx, args, false).map(CommandResult::Ok)
}

fn handle_count(ctx: &mut CommandContext<'_>, args: &[String]) -> AckResult<CommandResult> {
    let filter = TagFilter::parse(args)?;
    struct Counter<'f> {
        filter: &'f TagFilter,
        songs: usize,
        playtime: u64,
    }
    impl Visitor for Counter<'_> {
        fn on_song(&mut self, song: &SongHandle) -> color_eyre::Result<()> {
            if self.filter.matches(song, true) {
                self.songs += 1;
                self.playtime += song
                    .tag
                    .as_ref()
                    .and_then(|tag| tag.time)
                    .unwrap_or(0) as u64;
            }
            Ok(())
        }
    }
    let mut counter = Counter {
        filter: &filter,
        songs: 0,
        playtime: 0,
    };
    db_walk(ctx, None, &mut counter)?;
    ok(format!(
        "songs: {}\nplaytime: {}\n",
        counter.songs, counter.playtime
    ))
}

fn handle_list(ctx: &mut CommandContext<'_>, args: &[String]) -> AckResult<CommandResult> {
    let tag_type: TagType = args[0]
        .parse()
        .map_err(|_| AckError::new(Ack::Arg, format!("unknown type: {}", args[0])))?;
    let filter = if args.len() > 1 {
        Some(TagFilter::parse(&args[1..])?)
    } else {
        None
    };

    struct Values<'f> {
        tag_type: TagType,
        filter: Option<&'f TagFilter>,
        values: Vec<String>,
    }
    impl Visitor for Values<'_> {
        fn on_song(&mut self, song: &SongHandle) -> color_eyre::Result<()> {
            if let Some(filter) = self.filter
                && !filter.matches(song, true)
            {
                return Ok(());
            }
            if let Some(tag) = &song.tag {
                self.values
                    .extend(tag.values_of(self.tag_type).map(str::to_owned));
            }
            Ok(())
        }
    }

    let mut values = Values {
        tag_type,
        filter: filter.as_ref(),
        values: Vec::new(),
    };
    db_walk(ctx, None, &mut values)?;

    let mut out = String::new();
    for value in values.values.into_iter().sorted().dedup() {
        let _ = writeln!(out, "{tag_type}: {value}");
    }
    ok(out)
}

// ----- stored playlists -----------------------------------------------

fn handle_listplaylists(
    ctx: &mut CommandContext<'_>,
    _args: &[String],
) -> AckResult<CommandResult> {
    let mut out = String::new();
    for (name, mtime) in stored::list(&ctx.system.config.playlist_directory) {
        let _ = writeln!(out, "playlist: {name}");
        if let Ok(stamp) = jiff::Timestamp::from_second(mtime) {
            let _ = writeln!(out, "Last-Modified: {stamp}");
        }
    }
    ok(out)
}

fn handle_listplaylist(
    ctx: &mut CommandContext<'_>,
    args: &[String],
) -> AckResult<CommandResult> {
    let entries = stored::load(
        &ctx.system.config.playlist_directory,
        &args[0],
        ctx.system.config.max_playlist_length,
    )?;
    let mut out = String::new();
    for uri in entries {
        let _ = writeln!(out, "file: {uri}");
    }
    ok(out)
}

fn handle_listplaylistinfo(
    ctx: &mut CommandContext<'_>,
    args: &[String],
) -> AckResult<CommandResult> {
    let entries = stored::load(
        &ctx.system.config.playlist_directory,
        &args[0],
        ctx.system.config.max_playlist_length,
    )?;
    let mut out = String::new();
    for uri in entries {
        match ctx.system.db.get_song(Utf8Path::new(&uri)) {
            Some(song) => print_song(&mut out, &song),
            None => {
                let _ = writeln!(out, "file: {uri}");
            }
        }
    }
    ok(out)
}

fn handle_load(ctx: &mut CommandContext<'_>, args: &[String]) -> AckResult<CommandResult> {
    let system = &mut *ctx.system;
    let entries = stored::load(
        &system.config.playlist_directory,
        &args[0],
        system.config.max_playlist_length,
    )?;
    for uri in entries {
        // entries that vanished from the database are skipped
        if system
            .playlist
            .append_uri(&system.db, Utf8Path::new(&uri))
            .is_err()
        {
            tracing::debug!("skipping unknown playlist entry {uri}");
        }
    }
    empty()
}

fn handle_save(ctx: &mut CommandContext<'_>, args: &[String]) -> AckResult<CommandResult> {
    stored::save_queue(
        &ctx.system.config.playlist_directory,
        &args[0],
        &ctx.system.playlist.queue,
    )?;
    ctx.system.idle.emit(SubSystem::StoredPlaylist);
    empty()
}

fn handle_playlistadd(
    ctx: &mut CommandContext<'_>,
    args: &[String],
) -> AckResult<CommandResult> {
    let uri = Utf8Path::new(&args[1]);
    if !crate::song::uri_has_scheme(uri.as_str()) && ctx.system.db.get_song(uri).is_none() {
        return Err(AckError::no_such_song());
    }
    stored::append_uri(
        &ctx.system.config.playlist_directory,
        &args[0],
        &args[1],
        ctx.system.config.max_playlist_length,
    )?;
    ctx.system.idle.emit(SubSystem::StoredPlaylist);
    empty()
}

fn handle_playlistclear(
    ctx: &mut CommandContext<'_>,
    args: &[String],
) -> AckResult<CommandResult> {
    stored::clear(&ctx.system.config.playlist_directory, &args[0])?;
    ctx.system.idle.emit(SubSystem::StoredPlaylist);
    empty()
}

fn handle_playlistdelete(
    ctx: &mut CommandContext<'_>,
    args: &[String],
) -> AckResult<CommandResult> {
    let position = parse_unsigned(&args[1])? as usize;
    stored::delete_position(
        &ctx.system.config.playlist_directory,
        &args[0],
        position,
        ctx.system.config.max_playlist_length,
    )?;
    ctx.system.idle.emit(SubSystem::StoredPlaylist);
    empty()
}

fn handle_playlistmove(
    ctx: &mut CommandContext<'_>,
    args: &[String],
) -> AckResult<CommandResult> {
    let from = parse_unsigned(&args[1])? as usize;
    let to = parse_unsigned(&args[2])? as usize;
    stored::move_item(
        &ctx.system.config.playlist_directory,
        &args[0],
        from,
        to,
        ctx.system.config.max_playlist_length,
    )?;
    ctx.system.idle.emit(SubSystem::StoredPlaylist);
    empty()
}

fn handle_rename(ctx: &mut CommandContext<'_>, args: &[String]) -> AckResult<CommandResult> {
    stored::rename(&ctx.system.config.playlist_directory, &args[0], &args[1])?;
    ctx.system.idle.emit(SubSystem::StoredPlaylist);
    empty()
}

fn handle_rm(ctx: &mut CommandContext<'_>, args: &[String]) -> AckResult<CommandResult> {
    stored::remove(&ctx.system.config.playlist_directory, &args[0])?;
    ctx.system.idle.emit(SubSystem::StoredPlaylist);
    empty()
}

// ----- outputs, update, reflection ------------------------------------

fn handle_outputs(ctx: &mut CommandContext<'_>, _args: &[String]) -> AckResult<CommandResult> {
    let list = ctx.system.outputs.lock().unwrap().list();
    serialize(&list)
}

fn set_output_enabled(
    ctx: &mut CommandContext<'_>,
    args: &[String],
    enabled: bool,
) -> AckResult<CommandResult> {
    let id = parse_unsigned(&args[0])? as usize;
    if !ctx.system.outputs.lock().unwrap().set_enabled(id, enabled) {
        return Err(AckError::new(
            Ack::NoExist,
            format!("No such audio output: {id}"),
        ));
    }
    ctx.system.idle.emit(SubSystem::Output);
    empty()
}

fn handle_enableoutput(
    ctx: &mut CommandContext<'_>,
    args: &[String],
) -> AckResult<CommandResult> {
    set_output_enabled(ctx, args, true)
}

fn handle_disableoutput(
    ctx: &mut CommandContext<'_>,
    args: &[String],
) -> AckResult<CommandResult> {
    set_output_enabled(ctx, args, false)
}

fn handle_update(ctx: &mut CommandContext<'_>, args: &[String]) -> AckResult<CommandResult> {
    let uri = walk_uri(args);
    let id = ctx.system.enqueue_update(uri, false);
    if id == 0 {
        return Err(AckError::new(
            Ack::UpdateAlready,
            "already updating",
        ));
    }
    ok(format!("updating_db: {id}\n"))
}

fn handle_commands(ctx: &mut CommandContext<'_>, _args: &[String]) -> AckResult<CommandResult> {
    let mut out = String::new();
    for def in COMMANDS {
        if *ctx.permission & def.permission == def.permission {
            let _ = writeln!(out, "command: {}", def.name);
        }
    }
    ok(out)
}

fn handle_notcommands(
    ctx: &mut CommandContext<'_>,
    _args: &[String],
) -> AckResult<CommandResult> {
    let mut out = String::new();
    for def in COMMANDS {
        if *ctx.permission & def.permission != def.permission {
            let _ = writeln!(out, "command: {}", def.name);
        }
    }
    ok(out)
}

fn handle_tagtypes(
    _ctx: &mut CommandContext<'_>,
    _args: &[String],
) -> AckResult<CommandResult> {
    let mut out = String::new();
    for tag_type in TagType::iter() {
        let _ = writeln!(out, "tagtype: {tag_type}");
    }
    ok(out)
}

fn handle_urlhandlers(
    _ctx: &mut CommandContext<'_>,
    _args: &[String],
) -> AckResult<CommandResult> {
    // no remote input support is built in
    empty()
}

fn handle_decoders(
    _ctx: &mut CommandContext<'_>,
    _args: &[String],
) -> AckResult<CommandResult> {
    let mut out = String::new();
    for plugin in crate::decoder::plugins::all() {
        let _ = writeln!(out, "plugin: {}", plugin.name());
        for suffix in plugin.suffixes() {
            let _ = writeln!(out, "suffix: {suffix}");
        }
        for mime in plugin.mime_types() {
            let _ = writeln!(out, "mime_type: {mime}");
        }
    }
    ok(out)
}

fn handle_password(ctx: &mut CommandContext<'_>, args: &[String]) -> AckResult<CommandResult> {
    match ctx.system.check_password(&args[0]) {
        Some(granted) => {
            *ctx.permission = granted;
            empty()
        }
        None => Err(AckError::new(Ack::Password, "incorrect password")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_is_sorted_and_unique() {
        let names: Vec<&str> = COMMANDS.iter().map(|def| def.name).collect();
        let mut sorted = names.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(names, sorted);
    }

    #[test]
    fn spec_commands_are_present() {
        for name in [
            "play", "playid", "stop", "pause", "status", "currentsong", "add", "addid",
            "delete", "deleteid", "playlist", "playlistid", "playlistinfo", "plchanges",
            "plchangesposid", "shuffle", "clear", "save", "load", "listplaylist",
            "listplaylistinfo", "lsinfo", "rm", "find", "search", "count", "update",
            "next", "previous", "listall", "listallinfo", "volume", "setvol", "repeat",
            "random", "single", "consume", "stats", "clearerror", "list", "move",
            "moveid", "swap", "swapid", "seek", "seekid", "seekcur", "crossfade",
            "urlhandlers", "outputs", "enableoutput", "disableoutput", "commands",
            "notcommands", "playlistclear", "playlistadd", "playlistfind",
            "playlistsearch", "playlistmove", "playlistdelete", "rename", "tagtypes",
            "password", "ping", "close", "kill", "idle", "noidle", "prio", "prioid",
        ] {
            assert!(find(name).is_some(), "missing command {name}");
        }
    }

    #[test]
    fn permission_masks_guard_mutations() {
        assert_eq!(find("play").unwrap().permission, permission::CONTROL);
        assert_eq!(find("add").unwrap().permission, permission::ADD);
        assert_eq!(find("kill").unwrap().permission, permission::ADMIN);
        assert_eq!(find("ping").unwrap().permission, 0);
    }
}
