fn main() {
    safe_voice_lib::run()
}
