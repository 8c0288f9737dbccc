pub mod settings;
pub mod song_file;

pub use settings::EditorSettings;
pub use song_file::{read_song_file, write_song_file, SongFileError, SONG_FILE_EXTENSION};
